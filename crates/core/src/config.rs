use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::InferenceDevice;
use crate::model::{ModelConfig, DEFAULT_SCALE};
use crate::pipeline::PipelineOptions;
use crate::video_output::{DEFAULT_CODEC, DEFAULT_EXTENSION, DEFAULT_FOURCC, DEFAULT_SUFFIX};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "VIDSR_DATA_DIR";
const MAX_SCALE: u32 = 16;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Per-video frame limit; unset processes every frame.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_frames: Option<u64>,
    pub paths: PathsConfig,
    pub input: InputConfig,
    pub inference: InferenceConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub model_path: PathBuf,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InputConfig {
    /// Glob applied inside `paths.input_dir`.
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InferenceConfig {
    pub device: InferenceDevice,
    pub scale: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutputConfig {
    pub suffix: String,
    pub extension: String,
    pub codec: String,
    /// Empty string disables the `-vtag` override.
    pub fourcc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<u32>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/RRDB_ESRGAN_x4.onnx"),
            input_dir: PathBuf::from("input/video/test270"),
            output_dir: PathBuf::from("output/video"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            pattern: "*".to_string(),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            device: InferenceDevice::default(),
            scale: DEFAULT_SCALE,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            suffix: DEFAULT_SUFFIX.to_string(),
            extension: DEFAULT_EXTENSION.to_string(),
            codec: DEFAULT_CODEC.to_string(),
            fourcc: DEFAULT_FOURCC.to_string(),
            quality: None,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Reject settings that cannot produce a valid output.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_SCALE).contains(&self.inference.scale) {
            bail!(
                "inference.scale must be within 1..={MAX_SCALE}, got {}",
                self.inference.scale
            );
        }
        if self.input.pattern.trim().is_empty() {
            bail!("input.pattern must not be empty");
        }
        if self.output.extension.trim_start_matches('.').is_empty() {
            bail!("output.extension must not be empty");
        }
        if self.output.codec.trim().is_empty() {
            bail!("output.codec must not be empty");
        }
        if !self.output.fourcc.is_empty() && self.output.fourcc.len() != 4 {
            bail!(
                "output.fourcc must be exactly 4 characters, got '{}'",
                self.output.fourcc
            );
        }
        if let Some(q) = self.output.quality {
            if !(1..=31).contains(&q) {
                bail!("output.quality must be within 1..=31, got {q}");
            }
        }
        if self.output.suffix.is_empty() && self.paths.input_dir == self.paths.output_dir {
            bail!("output.suffix is empty and output_dir equals input_dir; inputs would be overwritten");
        }
        Ok(())
    }

    /// TRT cache lives under the data directory unless configured absolute.
    pub fn model_config(&self, data_dir: &Path) -> ModelConfig {
        ModelConfig {
            model_path: self.paths.model_path.clone(),
            device: self.inference.device,
            scale: self.inference.scale,
            trt_cache_dir: Some(resolve_relative_to(data_dir, &self.paths.trt_cache_dir)),
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            suffix: self.output.suffix.clone(),
            extension: self.output.extension.clone(),
            codec: self.output.codec.clone(),
            fourcc: Some(self.output.fourcc.clone()).filter(|tag| !tag.is_empty()),
            quality: self.output.quality,
            max_frames: self.max_frames,
        }
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. VIDSR_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and write a default config.toml on first run.
/// An existing config file is never touched.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(
            cfg.paths.model_path,
            PathBuf::from("models/RRDB_ESRGAN_x4.onnx")
        );
        assert_eq!(cfg.paths.input_dir, PathBuf::from("input/video/test270"));
        assert_eq!(cfg.paths.output_dir, PathBuf::from("output/video"));
        assert_eq!(cfg.input.pattern, "*");
        assert_eq!(cfg.inference.device, InferenceDevice::Cuda);
        assert_eq!(cfg.inference.scale, 4);
        assert_eq!(cfg.output.suffix, "_ESRGAN");
        assert_eq!(cfg.output.extension, "avi");
        assert_eq!(cfg.output.codec, "mpeg4");
        assert_eq!(cfg.output.fourcc, "XVID");
        assert_eq!(cfg.output.quality, None);
        assert_eq!(cfg.max_frames, None);
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut original = AppConfig::default();
        original.max_frames = Some(120);
        original.output.quality = Some(2);
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: AppConfig = toml::from_str(
            "max_frames = 10\n[inference]\ndevice = \"cpu\"\n[output]\ncodec = \"libx264\"\n",
        )
        .expect("parse partial config");
        assert_eq!(cfg.max_frames, Some(10));
        assert_eq!(cfg.inference.device, InferenceDevice::Cpu);
        assert_eq!(cfg.inference.scale, 4);
        assert_eq!(cfg.output.codec, "libx264");
        assert_eq!(cfg.output.fourcc, "XVID");
        assert_eq!(cfg.input.pattern, "*");
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let loaded = AppConfig::load_from_path(&temp.path().join("missing.toml"))
            .expect("load config from nonexistent path");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn load_reports_invalid_toml() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(&path, "[inference\nscale = 4").unwrap();
        let err = AppConfig::load_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse config TOML"));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = AppConfig::default();
        cfg.inference.scale = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.inference.scale = 1 << 30;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("inference.scale must be within 1..=16"));

        let mut cfg = AppConfig::default();
        cfg.output.fourcc = "XVIDX".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.output.quality = Some(40);
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.output.suffix.clear();
        cfg.paths.output_dir = cfg.paths.input_dir.clone();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn pipeline_options_follow_output_section() {
        let mut cfg = AppConfig::default();
        cfg.max_frames = Some(5);
        let options = cfg.pipeline_options();
        assert_eq!(options, PipelineOptions {
            max_frames: Some(5),
            ..PipelineOptions::default()
        });

        cfg.output.fourcc.clear();
        assert_eq!(cfg.pipeline_options().fourcc, None);
    }

    #[test]
    fn model_config_resolves_cache_under_data_dir() {
        let cfg = AppConfig::default();
        let model = cfg.model_config(Path::new("/data"));
        assert_eq!(model.model_path, PathBuf::from("models/RRDB_ESRGAN_x4.onnx"));
        assert_eq!(model.scale, 4);
        assert_eq!(model.trt_cache_dir, Some(PathBuf::from("/data/trt_cache")));
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn data_dir_env_then_default() {
        let old = env::var_os(ENV_DATA_DIR);

        env::set_var(ENV_DATA_DIR, "/env/path");
        assert_eq!(data_dir(None), PathBuf::from("/env/path"));
        env::remove_var(ENV_DATA_DIR);
        assert_eq!(data_dir(None), PathBuf::from("data"));

        if let Some(val) = old {
            env::set_var(ENV_DATA_DIR, val);
        }
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        let result = config_path(Path::new("/data"));
        assert_eq!(result, PathBuf::from("/data/config.toml"));
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("data");
        initialize_data_dir(&dir).expect("initialize data dir");

        assert!(dir.join("config.toml").exists());
        let loaded = AppConfig::load_from_path(&config_path(&dir)).unwrap();
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempfile::tempdir().unwrap();
        let cfg_path = temp.path().join("config.toml");
        let custom_content = "[inference]\nscale = 2\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(temp.path()).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn resolve_relative_to_handles_both_forms() {
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("/abs/path")),
            PathBuf::from("/abs/path")
        );
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("sub")),
            PathBuf::from("/base/sub")
        );
    }
}
