//! Typed failure kinds for the upscaling pipeline.
//!
//! Internals work with `anyhow::Result`; errors are classified into a
//! [`PipelineError`] at the point where the pipeline decides what to do with
//! them (abort the process, skip the file, or finalize a truncated output).

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Weight file missing or incompatible with the expected signature. Fatal.
    #[error("failed to load model {path}: {source:#}")]
    ModelLoad {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// Input cannot be opened or probed. The file is skipped.
    #[error("failed to open input {path}: {source:#}")]
    Open {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// Frame read failed mid-stream. Frames written so far are kept.
    #[error("decode failed for {path} after {frames_decoded} frames: {source:#}")]
    Decode {
        path: PathBuf,
        frames_decoded: u64,
        #[source]
        source: anyhow::Error,
    },

    /// Output sink could not be created, written or finalized.
    #[error("failed to write output {path}: {source:#}")]
    Write {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("inference failed on frame {frame_index} of {path}: {source:#}")]
    Inference {
        path: PathBuf,
        frame_index: u64,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to list inputs matching {pattern}: {source:#}")]
    Discover {
        pattern: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid configuration: {0:#}")]
    Config(#[source] anyhow::Error),
}

impl PipelineError {
    /// Short stable name for logs and summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ModelLoad { .. } => "model_load",
            Self::Open { .. } => "open",
            Self::Decode { .. } => "decode",
            Self::Write { .. } => "write",
            Self::Inference { .. } => "inference",
            Self::Discover { .. } => "discover",
            Self::Config(_) => "config",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ModelLoad { .. } | Self::Discover { .. } | Self::Config(_)
        )
    }
}
