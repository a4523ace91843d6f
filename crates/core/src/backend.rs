//! Compute device selection: CPU, CUDA EP, or TensorRT EP.
//!
//! Provides [`InferenceDevice`] and [`build_session`] to create an
//! `ort::Session` with the matching execution providers and optional TRT
//! engine caching.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session,
    },
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Where model parameters live and inference runs.
///
/// Chosen statically before the model is loaded. Fallback policy:
/// `Tensorrt` registers TRT then CUDA; if CUDA is unavailable the session
/// runs on CPU and a warning is logged. `Cpu` never touches a GPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceDevice {
    Cpu,
    #[default]
    #[serde(alias = "gpu")]
    Cuda,
    #[serde(alias = "trt")]
    Tensorrt,
}

impl InferenceDevice {
    /// Parse from string (case-insensitive). Returns `Cuda` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Self::Cpu,
            "tensorrt" | "trt" => Self::Tensorrt,
            _ => Self::Cuda,
        }
    }
}

impl std::fmt::Display for InferenceDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub device: InferenceDevice,
    pub trt_cache_dir: Option<&'a Path>,
}

/// Files and bytes under the engine cache, used to tell whether a session
/// build produced a new engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct CacheFootprint {
    files: u64,
    bytes: u64,
}

impl CacheFootprint {
    fn measure(root: &Path) -> Self {
        let mut footprint = Self::default();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                match entry.metadata() {
                    Ok(meta) if meta.is_dir() => pending.push(entry.path()),
                    Ok(meta) if meta.is_file() => {
                        footprint.files += 1;
                        footprint.bytes += meta.len();
                    }
                    _ => {}
                }
            }
        }
        footprint
    }

    fn grew_since(&self, before: &Self) -> bool {
        self.files > before.files || self.bytes > before.bytes
    }
}

/// Logs every `interval` until dropped. Engine builds can take minutes
/// with no output from ORT.
struct BuildTicker {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl BuildTicker {
    fn start(interval: Duration) -> Self {
        let (stop, stopped) = channel::<()>();
        let handle = thread::spawn(move || {
            let started = Instant::now();
            while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                info!(
                    elapsed_secs = started.elapsed().as_secs(),
                    "Still building TensorRT engine"
                );
            }
        });
        Self {
            stop: Some(stop),
            handle: Some(handle),
        }
    }
}

impl Drop for BuildTicker {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn commit(builder: SessionBuilder, model_path: &Path) -> Result<Session> {
    builder
        .commit_from_file(model_path)
        .with_context(|| format!("failed to load ONNX model {}", model_path.display()))
}

/// Build an `ort::Session` on the requested device.
///
/// Sessions are inference-only; ORT keeps no gradient state.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    match config.device {
        InferenceDevice::Cpu => {
            debug!("Building CPU session");
            commit(builder, config.model_path)
        }
        InferenceDevice::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA execution provider unavailable; running on CPU");
            }
            debug!("Building CUDA session");
            commit(
                builder.with_execution_providers([cuda.build()])?,
                config.model_path,
            )
        }
        InferenceDevice::Tensorrt => build_tensorrt_session(builder, config),
    }
}

fn build_tensorrt_session(builder: SessionBuilder, config: &SessionConfig<'_>) -> Result<Session> {
    let cache_dir = config.trt_cache_dir.unwrap_or(Path::new("trt_cache"));
    if let Err(e) = std::fs::create_dir_all(cache_dir) {
        warn!(dir = %cache_dir.display(), error = %e, "Cannot create TensorRT engine cache");
    }

    let before = CacheFootprint::measure(cache_dir);
    info!(
        cache_dir = %cache_dir.display(),
        cached_files = before.files,
        "Building TensorRT session; an uncached engine takes minutes"
    );

    let trt = TensorRTExecutionProvider::default()
        .with_device_id(0)
        .with_engine_cache(true)
        .with_engine_cache_path(cache_dir.to_string_lossy().to_string());
    let started = Instant::now();
    let result = {
        let _ticker = BuildTicker::start(Duration::from_secs(15));
        // CUDA second: TRT drops out at runtime if libnvinfer is missing.
        builder
            .with_execution_providers([trt.build(), CUDAExecutionProvider::default().build()])
            .map_err(anyhow::Error::from)
            .and_then(|b| commit(b, config.model_path))
    };
    let elapsed_secs = started.elapsed().as_secs_f64();

    match &result {
        Ok(_) => {
            let after = CacheFootprint::measure(cache_dir);
            info!(
                elapsed_secs,
                engine_cached = after.grew_since(&before),
                cached_files = after.files,
                cached_bytes = after.bytes,
                "TensorRT session ready"
            );
        }
        Err(e) => error!(elapsed_secs, error = %format!("{e:#}"), "TensorRT session build failed"),
    }
    result
}

/// Engine cache subdirectory name for a model: `<fingerprint prefix>`.
///
/// Engines are tied to the exact weights, so a changed model file never
/// reuses a stale engine.
pub fn trt_cache_key(model_fingerprint: &str) -> String {
    model_fingerprint.chars().take(16).collect()
}

pub fn resolve_trt_cache_dir(base_dir: &Path, cache_key: Option<&str>) -> PathBuf {
    match cache_key {
        Some(key) if !key.is_empty() => base_dir.join(key),
        _ => base_dir.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_from_str_lossy() {
        assert_eq!(InferenceDevice::from_str_lossy("cpu"), InferenceDevice::Cpu);
        assert_eq!(InferenceDevice::from_str_lossy("CPU"), InferenceDevice::Cpu);
        assert_eq!(InferenceDevice::from_str_lossy("cuda"), InferenceDevice::Cuda);
        assert_eq!(InferenceDevice::from_str_lossy("gpu"), InferenceDevice::Cuda);
        assert_eq!(
            InferenceDevice::from_str_lossy("TensorRT"),
            InferenceDevice::Tensorrt
        );
        assert_eq!(
            InferenceDevice::from_str_lossy("trt"),
            InferenceDevice::Tensorrt
        );
        assert_eq!(
            InferenceDevice::from_str_lossy("unknown"),
            InferenceDevice::Cuda
        );
        assert_eq!(InferenceDevice::from_str_lossy(""), InferenceDevice::Cuda);
    }

    #[test]
    fn test_device_default_and_display() {
        assert_eq!(InferenceDevice::default(), InferenceDevice::Cuda);
        assert_eq!(InferenceDevice::Cpu.to_string(), "cpu");
        assert_eq!(InferenceDevice::Cuda.to_string(), "cuda");
        assert_eq!(InferenceDevice::Tensorrt.to_string(), "tensorrt");
    }

    #[test]
    fn test_device_serde_lowercase() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            device: InferenceDevice,
        }
        let parsed: Wrapper = toml::from_str("device = \"tensorrt\"").unwrap();
        assert_eq!(parsed.device, InferenceDevice::Tensorrt);
        let parsed: Wrapper = toml::from_str("device = \"trt\"").unwrap();
        assert_eq!(parsed.device, InferenceDevice::Tensorrt);
        let parsed: Wrapper = toml::from_str("device = \"gpu\"").unwrap();
        assert_eq!(parsed.device, InferenceDevice::Cuda);
        let encoded = toml::to_string(&Wrapper {
            device: InferenceDevice::Cpu,
        })
        .unwrap();
        assert!(encoded.contains("\"cpu\""));
    }

    #[test]
    fn test_trt_cache_key_truncates_fingerprint() {
        let key = trt_cache_key("0123456789abcdef0123456789abcdef");
        assert_eq!(key, "0123456789abcdef");
        assert_eq!(trt_cache_key("abc"), "abc");
    }

    #[test]
    fn test_resolve_trt_cache_dir() {
        let base = PathBuf::from("trt_cache");
        assert_eq!(
            resolve_trt_cache_dir(&base, Some("0123abcd")),
            PathBuf::from("trt_cache/0123abcd")
        );
        assert_eq!(resolve_trt_cache_dir(&base, None), base);
        assert_eq!(resolve_trt_cache_dir(&base, Some("")), base);
    }

    #[test]
    fn test_cache_footprint_counts_nested_engines() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("0123abcd")).unwrap();
        std::fs::write(temp.path().join("a.engine"), b"1234").unwrap();
        let before = CacheFootprint::measure(temp.path());
        std::fs::write(temp.path().join("0123abcd/b.engine"), b"12").unwrap();
        let after = CacheFootprint::measure(temp.path());

        assert_eq!(before, CacheFootprint { files: 1, bytes: 4 });
        assert_eq!(after, CacheFootprint { files: 2, bytes: 6 });
        assert!(after.grew_since(&before));
        assert!(!before.grew_since(&after));
        assert_eq!(
            CacheFootprint::measure(&temp.path().join("missing")),
            CacheFootprint::default()
        );
    }

    #[test]
    fn test_build_ticker_stops_on_drop() {
        let ticker = BuildTicker::start(Duration::from_secs(3600));
        let started = Instant::now();
        drop(ticker);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
