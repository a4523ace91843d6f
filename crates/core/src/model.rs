//! Super-resolution model: an opaque `[1,3,H,W] → [1,3,sH,sW]` function.
//!
//! [`SuperResModel`] is the seam the pipeline depends on. The production
//! implementation, [`OnnxSuperResModel`], wraps an `ort::Session` built once
//! at startup; tests substitute deterministic in-memory models.
//!
//! Both FP32 and FP16 ONNX exports are accepted. Either way the model
//! consumes and produces RGB values normalized to `[0, 1]`.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, ensure, Context, Result};
use half::f16;
use ndarray::{Array4, ArrayD, Ix4};
use ort::session::Session;
use ort::tensor::TensorElementType;
use ort::value::{Tensor, ValueType};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::backend::{build_session, resolve_trt_cache_dir, trt_cache_key, InferenceDevice, SessionConfig};
use crate::convert::{nchw_f16_to_f32, nchw_f32_to_f16};
use crate::error::PipelineError;

/// Fixed upscale factor of the shipped ESRGAN x4 weights.
pub const DEFAULT_SCALE: u32 = 4;

pub trait SuperResModel {
    /// Integer factor applied to both spatial dimensions.
    fn scale(&self) -> u32;

    /// Forward pass only. Input is `[1, 3, H, W]`, output must be
    /// `[1, 3, H * scale, W * scale]`.
    fn upscale(&mut self, input: &Array4<f32>) -> Result<Array4<f32>>;
}

impl<M: SuperResModel + ?Sized> SuperResModel for Box<M> {
    fn scale(&self) -> u32 {
        (**self).scale()
    }

    fn upscale(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        (**self).upscale(input)
    }
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub model_path: PathBuf,
    pub device: InferenceDevice,
    pub scale: u32,
    pub trt_cache_dir: Option<PathBuf>,
}

/// Element type the ONNX graph declares for its image input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelPrecision {
    Fp32,
    Fp16,
}

/// Validated IO signature of a loaded ONNX model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSignature {
    pub input_name: String,
    pub output_name: String,
    pub precision: ModelPrecision,
}

pub struct OnnxSuperResModel {
    session: Session,
    signature: ModelSignature,
    scale: u32,
    fingerprint: String,
}

impl OnnxSuperResModel {
    /// Load weights onto the configured device. Any failure here is a
    /// [`PipelineError::ModelLoad`] and should abort the process.
    pub fn load(config: &ModelConfig) -> Result<Self, PipelineError> {
        Self::load_inner(config).map_err(|source| PipelineError::ModelLoad {
            path: config.model_path.clone(),
            source,
        })
    }

    fn load_inner(config: &ModelConfig) -> Result<Self> {
        ensure!(config.scale >= 1, "scale must be at least 1, got {}", config.scale);
        if !config.model_path.is_file() {
            bail!("model file does not exist: {}", config.model_path.display());
        }

        let fingerprint = model_fingerprint(&config.model_path)?;
        let trt_cache_dir = config
            .trt_cache_dir
            .as_deref()
            .map(|base| resolve_trt_cache_dir(base, Some(&trt_cache_key(&fingerprint))));

        debug!(
            model = %config.model_path.display(),
            device = %config.device,
            scale = config.scale,
            fingerprint = %fingerprint,
            "Loading ONNX super-resolution model"
        );

        let session = build_session(&SessionConfig {
            model_path: &config.model_path,
            device: config.device,
            trt_cache_dir: trt_cache_dir.as_deref(),
        })?;

        let inputs: Vec<(String, ValueType)> = session
            .inputs()
            .iter()
            .map(|input| (input.name().to_string(), input.dtype().clone()))
            .collect();
        let outputs: Vec<String> = session
            .outputs()
            .iter()
            .map(|output| output.name().to_string())
            .collect();
        let signature = validate_signature(&inputs, &outputs)?;

        info!(
            model = %config.model_path.display(),
            device = %config.device,
            input = %signature.input_name,
            output = %signature.output_name,
            precision = ?signature.precision,
            fingerprint = %&fingerprint[..12],
            "Model loaded"
        );

        Ok(Self {
            session,
            signature,
            scale: config.scale,
            fingerprint,
        })
    }

    pub fn signature(&self) -> &ModelSignature {
        &self.signature
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn run_fp32(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let input_tensor = Tensor::from_array(input.clone())?;
        let outputs = self
            .session
            .run(ort::inputs![self.signature.input_name.as_str() => &input_tensor])?;
        let output_view = outputs[self.signature.output_name.as_str()].try_extract_array::<f32>()?;
        Ok(output_view.to_owned().into_dimensionality::<Ix4>()?)
    }

    fn run_fp16(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let input_tensor = Tensor::from_array(nchw_f32_to_f16(input)?)?;
        let outputs = self
            .session
            .run(ort::inputs![self.signature.input_name.as_str() => &input_tensor])?;
        let output_view = outputs[self.signature.output_name.as_str()].try_extract_array::<f16>()?;
        let owned: ArrayD<f16> = output_view.to_owned();
        nchw_f16_to_f32(&owned)
    }
}

impl SuperResModel for OnnxSuperResModel {
    fn scale(&self) -> u32 {
        self.scale
    }

    fn upscale(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let output = match self.signature.precision {
            ModelPrecision::Fp32 => self.run_fp32(input)?,
            ModelPrecision::Fp16 => self.run_fp16(input)?,
        };
        check_output_shape(input, &output, self.scale)?;
        Ok(output)
    }
}

/// Strict IO check: one image input (float32/float16, rank 4, 3 channels or
/// dynamic) and one output. Anything else is incompatible with the pipeline.
pub fn validate_signature(
    inputs: &[(String, ValueType)],
    outputs: &[String],
) -> Result<ModelSignature> {
    if inputs.len() != 1 {
        bail!("incompatible model: expected exactly 1 input, found {}", inputs.len());
    }
    if outputs.len() != 1 {
        bail!(
            "incompatible model: expected exactly 1 output, found {}",
            outputs.len()
        );
    }

    let (input_name, dtype) = &inputs[0];
    let ValueType::Tensor { ty, shape, .. } = dtype else {
        bail!("incompatible model: input '{input_name}' is not a tensor");
    };

    let precision = match ty {
        TensorElementType::Float32 => ModelPrecision::Fp32,
        TensorElementType::Float16 => ModelPrecision::Fp16,
        other => bail!("incompatible model: unsupported input element type {other:?}"),
    };

    let dims: Vec<i64> = shape.iter().copied().collect();
    if dims.len() != 4 {
        bail!(
            "incompatible model: input '{input_name}' must be rank 4 (NCHW), got shape {dims:?}"
        );
    }
    // Negative dims are symbolic (dynamic) and accepted.
    if dims[1] >= 0 && dims[1] != 3 {
        bail!(
            "incompatible model: input '{input_name}' must have 3 channels, got shape {dims:?}"
        );
    }

    Ok(ModelSignature {
        input_name: input_name.clone(),
        output_name: outputs[0].clone(),
        precision,
    })
}

/// Output must be exactly `scale ×` the input in both spatial dimensions.
pub fn check_output_shape(input: &Array4<f32>, output: &Array4<f32>, scale: u32) -> Result<()> {
    let s = scale as usize;
    let expected = [1, 3, input.shape()[2] * s, input.shape()[3] * s];
    if output.shape() != expected {
        return Err(anyhow!(
            "model output shape {:?} does not match expected {:?} (scale {})",
            output.shape(),
            expected,
            scale
        ));
    }
    Ok(())
}

/// Hex SHA-256 of the weight file.
pub fn model_fingerprint(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .with_context(|| format!("failed to open model file: {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .with_context(|| format!("failed to read model file: {}", path.display()))?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NearestX2;

    impl SuperResModel for NearestX2 {
        fn scale(&self) -> u32 {
            2
        }

        fn upscale(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
            let (n, c, h, w) = input.dim();
            Ok(Array4::from_shape_fn((n, c, h * 2, w * 2), |(b, ch, y, x)| {
                input[[b, ch, y / 2, x / 2]]
            }))
        }
    }

    #[test]
    fn test_boxed_model_delegates() {
        let mut model: Box<dyn SuperResModel> = Box::new(NearestX2);
        assert_eq!(model.scale(), 2);
        let input = Array4::<f32>::ones((1, 3, 2, 3));
        let output = model.upscale(&input).unwrap();
        assert_eq!(output.shape(), &[1, 3, 4, 6]);
        check_output_shape(&input, &output, model.scale()).unwrap();
    }

    #[test]
    fn test_check_output_shape_rejects_wrong_scale() {
        let input = Array4::<f32>::zeros((1, 3, 4, 5));
        let output = Array4::<f32>::zeros((1, 3, 8, 10));
        assert!(check_output_shape(&input, &output, 2).is_ok());
        let err = check_output_shape(&input, &output, 4).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_model_fingerprint_is_stable_sha256() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("weights.onnx");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            model_fingerprint(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_load_missing_model_is_model_load_error() {
        let temp = tempfile::tempdir().unwrap();
        let config = ModelConfig {
            model_path: temp.path().join("missing.onnx"),
            device: InferenceDevice::Cpu,
            scale: DEFAULT_SCALE,
            trt_cache_dir: None,
        };
        let err = OnnxSuperResModel::load(&config).err().expect("should fail");
        assert_eq!(err.kind(), "model_load");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_load_rejects_zero_scale() {
        let config = ModelConfig {
            model_path: PathBuf::from("unused.onnx"),
            device: InferenceDevice::Cpu,
            scale: 0,
            trt_cache_dir: None,
        };
        let err = OnnxSuperResModel::load(&config).err().expect("should fail");
        assert!(err.to_string().contains("scale must be at least 1"));
    }

    #[test]
    fn test_validate_signature_counts() {
        let err = validate_signature(&[], &["out".to_string()]).unwrap_err();
        assert!(err.to_string().contains("exactly 1 input"));
    }

    /// Requires ONNX Runtime + model file. Run: `cargo test -p vidsr-core -- --ignored`
    #[test]
    #[ignore]
    fn test_onnx_model_upscales_small_frame() {
        let config = ModelConfig {
            model_path: PathBuf::from("models/RRDB_ESRGAN_x4.onnx"),
            device: InferenceDevice::Cpu,
            scale: DEFAULT_SCALE,
            trt_cache_dir: None,
        };
        let mut model = OnnxSuperResModel::load(&config).expect("model should load");
        let input = Array4::<f32>::from_elem((1, 3, 8, 8), 0.5);
        let output = model.upscale(&input).expect("inference should succeed");
        assert_eq!(output.shape(), &[1, 3, 32, 32]);

        let again = model.upscale(&input).expect("inference should succeed");
        assert_eq!(output, again);
    }
}
