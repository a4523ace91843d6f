//! Per-video super-resolution loop and batch driver.
//!
//! [`Upscaler`] owns the model and pulls frames from a [`FrameSource`],
//! runs each one through the model and pushes the result into a
//! [`FrameSink`]. Sources and sinks come from a [`VideoIo`] factory so the
//! loop runs the same against FFmpeg subprocesses and in-memory doubles.
//!
//! Frames are processed strictly one at a time, in decode order.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{anyhow, ensure, Result};
use tracing::{debug, error, info, warn};

use crate::convert::{bgr_frame_to_nchw, nchw_to_bgr_frame};
use crate::error::PipelineError;
use crate::model::SuperResModel;
use crate::types::{Frame, VideoStreamInfo};
use crate::video_input::{probe_video, VideoDecoder};
use crate::video_output::{
    output_path_for, EncoderConfig, VideoEncoder, DEFAULT_CODEC, DEFAULT_EXTENSION,
    DEFAULT_FOURCC, DEFAULT_SUFFIX,
};

pub trait FrameSource {
    fn info(&self) -> &VideoStreamInfo;

    /// `Ok(None)` is a clean end of stream. `Err` is a decode failure.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Release the source. May surface a failure that only shows up after
    /// the last frame (e.g. a non-zero decoder exit).
    fn finish(&mut self) -> Result<()>;
}

pub trait FrameSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

pub trait VideoIo {
    type Source: FrameSource;
    type Sink: FrameSink;

    fn open_source(&self, path: &Path) -> Result<Self::Source>;
    fn open_sink(&self, config: &EncoderConfig) -> Result<Self::Sink>;

    /// Delete a partially written output after an aborted run.
    fn discard_output(&self, path: &Path) -> Result<()> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// ffprobe + ffmpeg subprocesses.
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegVideoIo;

impl VideoIo for FfmpegVideoIo {
    type Source = VideoDecoder;
    type Sink = VideoEncoder;

    fn open_source(&self, path: &Path) -> Result<VideoDecoder> {
        let info = probe_video(path)?;
        VideoDecoder::open(path, info)
    }

    fn open_sink(&self, config: &EncoderConfig) -> Result<VideoEncoder> {
        VideoEncoder::open(config)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    pub suffix: String,
    pub extension: String,
    pub codec: String,
    pub fourcc: Option<String>,
    pub quality: Option<u32>,
    /// Stop after this many frames per video.
    pub max_frames: Option<u64>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            suffix: DEFAULT_SUFFIX.to_string(),
            extension: DEFAULT_EXTENSION.to_string(),
            codec: DEFAULT_CODEC.to_string(),
            fourcc: Some(DEFAULT_FOURCC.to_string()),
            quality: None,
            max_frames: None,
        }
    }
}

#[derive(Debug)]
pub enum VideoStatus {
    Completed,
    /// Decoding stopped early; frames produced before the failure were kept.
    Truncated(PipelineError),
}

#[derive(Debug)]
pub struct VideoReport {
    pub input: PathBuf,
    pub output: PathBuf,
    pub frames: u64,
    pub width: u32,
    pub height: u32,
    pub fps: String,
    pub elapsed: Duration,
    pub status: VideoStatus,
}

impl VideoReport {
    pub fn is_complete(&self) -> bool {
        matches!(self.status, VideoStatus::Completed)
    }
}

#[derive(Debug, Default)]
pub struct BatchSummary {
    pub reports: Vec<VideoReport>,
    pub failures: Vec<(PathBuf, PipelineError)>,
}

impl BatchSummary {
    pub fn completed(&self) -> usize {
        self.reports.iter().filter(|r| r.is_complete()).count()
    }

    pub fn truncated(&self) -> usize {
        self.reports.len() - self.completed()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// True when any input was skipped, aborted or truncated.
    pub fn has_failures(&self) -> bool {
        self.failed() > 0 || self.truncated() > 0
    }

    pub fn total_frames(&self) -> u64 {
        self.reports.iter().map(|r| r.frames).sum()
    }
}

/// Called with `(frames_done, total_estimate)`. `frames_done == 0` marks the
/// start of a new video.
pub type ProgressCallback = Box<dyn FnMut(u64, Option<u64>) + Send>;

pub struct Upscaler<M> {
    model: M,
    options: PipelineOptions,
    progress: Option<ProgressCallback>,
}

impl<M: SuperResModel> Upscaler<M> {
    pub fn new(model: M, options: PipelineOptions) -> Self {
        Self {
            model,
            options,
            progress: None,
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    fn report_progress(&mut self, done: u64, total: Option<u64>) {
        if let Some(callback) = self.progress.as_mut() {
            callback(done, total);
        }
    }

    /// One frame through convert → model → convert back.
    pub fn upscale_frame(&mut self, frame: &Frame) -> Result<Frame> {
        let scale = self.model.scale();
        let (width, height) = frame
            .width
            .checked_mul(scale)
            .zip(frame.height.checked_mul(scale))
            .ok_or_else(|| anyhow!("{}x{} frame overflows at scale {scale}", frame.width, frame.height))?;
        let input = bgr_frame_to_nchw(frame)?;
        let output = self.model.upscale(&input)?;
        let upscaled = nchw_to_bgr_frame(&output)?;
        ensure!(
            upscaled.width == width && upscaled.height == height,
            "upscaled frame is {}x{}, expected {width}x{height}",
            upscaled.width,
            upscaled.height
        );
        Ok(upscaled)
    }

    pub fn process_video<IO: VideoIo>(
        &mut self,
        io: &IO,
        input: &Path,
        output_dir: &Path,
    ) -> Result<VideoReport, PipelineError> {
        let started = Instant::now();
        let mut source = io.open_source(input).map_err(|source| PipelineError::Open {
            path: input.to_path_buf(),
            source,
        })?;
        let info = source.info().clone();

        let output_path = output_path_for(
            input,
            output_dir,
            &self.options.suffix,
            &self.options.extension,
        );
        let (width, height) = info
            .scaled_dimensions(self.model.scale())
            .map_err(|source| PipelineError::Write {
                path: output_path.clone(),
                source,
            })?;
        let encoder_config = EncoderConfig {
            output_path: output_path.clone(),
            width,
            height,
            fps: info.fps_rational.clone(),
            codec: self.options.codec.clone(),
            fourcc: self.options.fourcc.clone(),
            quality: self.options.quality,
        };

        let mut sink = io
            .open_sink(&encoder_config)
            .map_err(|source| PipelineError::Write {
                path: output_path.clone(),
                source,
            })?;

        info!(
            input = %input.display(),
            output = %output_path.display(),
            src = %format!("{}x{}", info.width, info.height),
            dst = %format!("{width}x{height}"),
            fps = %info.fps_rational,
            frames = ?info.frame_count,
            "Processing video"
        );

        let total = match (info.frame_count, self.options.max_frames) {
            (Some(n), Some(limit)) => Some(n.min(limit)),
            (None, Some(limit)) => Some(limit),
            (n, None) => n,
        };
        self.report_progress(0, total);

        let mut frames_done: u64 = 0;
        let mut decode_failure: Option<PipelineError> = None;
        loop {
            if self.options.max_frames.is_some_and(|limit| frames_done >= limit) {
                debug!(limit = frames_done, "Frame limit reached");
                break;
            }

            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(source_err) => {
                    warn!(
                        input = %input.display(),
                        frames = frames_done,
                        error = %format!("{source_err:#}"),
                        "Decode failed; finalizing frames produced so far"
                    );
                    decode_failure = Some(PipelineError::Decode {
                        path: input.to_path_buf(),
                        frames_decoded: frames_done,
                        source: source_err,
                    });
                    break;
                }
            };

            let upscaled = match self.upscale_frame(&frame) {
                Ok(upscaled) => upscaled,
                Err(source_err) => {
                    drop(sink);
                    self.discard(io, &output_path);
                    return Err(PipelineError::Inference {
                        path: input.to_path_buf(),
                        frame_index: frames_done,
                        source: source_err,
                    });
                }
            };

            if let Err(source_err) = sink.write_frame(&upscaled) {
                drop(sink);
                self.discard(io, &output_path);
                return Err(PipelineError::Write {
                    path: output_path,
                    source: source_err,
                });
            }

            frames_done += 1;
            self.report_progress(frames_done, total);
        }

        if decode_failure.is_none() {
            if let Err(source_err) = source.finish() {
                warn!(
                    input = %input.display(),
                    error = %format!("{source_err:#}"),
                    "Decoder reported failure after end of stream"
                );
                decode_failure = Some(PipelineError::Decode {
                    path: input.to_path_buf(),
                    frames_decoded: frames_done,
                    source: source_err,
                });
            }
        }
        drop(source);

        if frames_done == 0 {
            warn!(input = %input.display(), "No frames decoded; output will be empty");
        }

        if let Err(source_err) = sink.finish() {
            drop(sink);
            self.discard(io, &output_path);
            return Err(PipelineError::Write {
                path: output_path,
                source: source_err,
            });
        }

        let elapsed = started.elapsed();
        let status = match decode_failure {
            Some(err) => VideoStatus::Truncated(err),
            None => VideoStatus::Completed,
        };
        info!(
            output = %output_path.display(),
            frames = frames_done,
            elapsed_secs = elapsed.as_secs_f64(),
            complete = matches!(status, VideoStatus::Completed),
            "Finished video"
        );

        Ok(VideoReport {
            input: input.to_path_buf(),
            output: output_path,
            frames: frames_done,
            width,
            height,
            fps: info.fps_rational,
            elapsed,
            status,
        })
    }

    fn discard<IO: VideoIo>(&self, io: &IO, output_path: &Path) {
        if let Err(err) = io.discard_output(output_path) {
            warn!(
                output = %output_path.display(),
                error = %err,
                "Failed to remove partial output"
            );
        }
    }

    /// Process every input in order. Per-file failures are logged and
    /// collected; they never stop the batch.
    pub fn run_batch<IO: VideoIo>(
        &mut self,
        io: &IO,
        inputs: &[PathBuf],
        output_dir: &Path,
    ) -> BatchSummary {
        let mut summary = BatchSummary::default();
        info!(
            count = inputs.len(),
            output_dir = %output_dir.display(),
            "Starting batch"
        );

        for (i, input) in inputs.iter().enumerate() {
            debug!(index = i + 1, total = inputs.len(), input = %input.display(), "Next input");
            match self.process_video(io, input, output_dir) {
                Ok(report) => summary.reports.push(report),
                Err(err) => {
                    error!(
                        input = %input.display(),
                        kind = err.kind(),
                        error = %err,
                        "Skipping input"
                    );
                    summary.failures.push((input.clone(), err));
                }
            }
        }

        info!(
            completed = summary.completed(),
            truncated = summary.truncated(),
            failed = summary.failed(),
            frames = summary.total_frames(),
            "Batch finished"
        );
        summary
    }
}

/// Regular files in `input_dir` whose names match `pattern`, sorted by path.
pub fn discover_inputs(input_dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, PipelineError> {
    let full_pattern = input_dir.join(pattern).to_string_lossy().into_owned();
    let discover_err = |source: anyhow::Error| PipelineError::Discover {
        pattern: full_pattern.clone(),
        source,
    };

    if !input_dir.is_dir() {
        return Err(discover_err(anyhow::anyhow!(
            "input directory does not exist: {}",
            input_dir.display()
        )));
    }

    let entries = glob::glob(&full_pattern).map_err(|e| discover_err(e.into()))?;
    let mut inputs = Vec::new();
    for entry in entries {
        match entry {
            Ok(path) if path.is_file() => inputs.push(path),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Unreadable path while listing inputs"),
        }
    }
    inputs.sort();
    Ok(inputs)
}
