//! Batch video super-resolution: decode with FFmpeg, upscale every frame
//! with an ONNX model, encode the result.

pub mod backend;
pub mod config;
pub mod convert;
pub mod error;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod runtime;
pub mod types;
pub mod video_input;
pub mod video_output;

pub use error::PipelineError;
pub use model::{OnnxSuperResModel, SuperResModel};
pub use pipeline::{BatchSummary, FfmpegVideoIo, PipelineOptions, Upscaler};
