//! FFmpeg encoder: packed BGR24 frames in on stdin, compressed video out.
//!
//! The default output is MPEG-4 Part 2 tagged `XVID` in an AVI container.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Stdio};
use std::thread::JoinHandle;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, info};

use crate::pipeline::FrameSink;
use crate::runtime::{spawn_stderr_logger, FfmpegRole};
use crate::types::Frame;

pub const DEFAULT_SUFFIX: &str = "_ESRGAN";
pub const DEFAULT_EXTENSION: &str = "avi";
pub const DEFAULT_CODEC: &str = "mpeg4";
pub const DEFAULT_FOURCC: &str = "XVID";

/// Everything the encoder needs to open an output file.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderConfig {
    pub output_path: PathBuf,
    pub width: u32,
    pub height: u32,
    /// Frame rate as a rational string (e.g. "30000/1001").
    pub fps: String,
    /// FFmpeg encoder name (e.g. "mpeg4").
    pub codec: String,
    /// Four-character codec tag written to the container (e.g. "XVID").
    pub fourcc: Option<String>,
    /// `-q:v` quantizer; `None` leaves the encoder default.
    pub quality: Option<u32>,
}

impl EncoderConfig {
    pub fn build_ffmpeg_args(&self) -> Vec<String> {
        let size = format!("{}x{}", self.width, self.height);

        let mut args: Vec<String> = vec![
            "-nostdin".into(),
            "-y".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "bgr24".into(),
            "-s".into(),
            size,
            "-r".into(),
            self.fps.clone(),
            "-i".into(),
            "pipe:0".into(),
            "-an".into(),
            "-c:v".into(),
            self.codec.clone(),
        ];

        if let Some(ref tag) = self.fourcc {
            args.extend(["-vtag".into(), tag.clone()]);
        }
        if let Some(q) = self.quality {
            args.extend(["-q:v".into(), q.to_string()]);
        }

        args.extend([
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-v".into(),
            "error".into(),
        ]);
        args.push(self.output_path.to_string_lossy().into_owned());

        args
    }

    pub fn frame_size(&self) -> usize {
        Frame::byte_len(self.width, self.height)
    }
}

/// `<output_dir>/<input stem><suffix>.<extension>`.
pub fn output_path_for(input: &Path, output_dir: &Path, suffix: &str, extension: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let extension = extension.trim_start_matches('.');
    output_dir.join(format!("{stem}{suffix}.{extension}"))
}

/// FFmpeg encode subprocess. Accepts raw BGR frames via stdin pipe, drains
/// stderr in a background thread, kills FFmpeg on [`Drop`].
pub struct VideoEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_thread: Option<JoinHandle<()>>,
    frame_size: usize,
    width: u32,
    height: u32,
    output_path: PathBuf,
    frames_written: u64,
}

impl VideoEncoder {
    pub fn open(config: &EncoderConfig) -> Result<Self> {
        if config.width == 0 || config.height == 0 {
            bail!(
                "invalid output dimensions {}x{}",
                config.width,
                config.height
            );
        }
        if let Some(parent) = config.output_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create output directory {}", parent.display())
                })?;
            }
        }

        let args = config.build_ffmpeg_args();
        debug!(
            cmd = %format!("ffmpeg {}", args.join(" ")),
            "launching FFmpeg encoder"
        );

        let mut child = crate::runtime::command_for("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg (is it installed?)")?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to open ffmpeg stdin"))?;

        let stderr_thread = child
            .stderr
            .take()
            .map(|stderr| spawn_stderr_logger(stderr, FfmpegRole::Encode));

        debug!(
            output = %config.output_path.display(),
            width = config.width,
            height = config.height,
            fps = %config.fps,
            codec = %config.codec,
            fourcc = ?config.fourcc,
            "FFmpeg encoder started"
        );

        Ok(Self {
            child,
            stdin: Some(stdin),
            stderr_thread,
            frame_size: config.frame_size(),
            width: config.width,
            height: config.height,
            output_path: config.output_path.clone(),
            frames_written: 0,
        })
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if frame.width != self.width || frame.height != self.height {
            bail!(
                "frame dimensions mismatch: encoder expects {}x{}, got {}x{}",
                self.width,
                self.height,
                frame.width,
                frame.height
            );
        }
        if frame.data.len() != self.frame_size {
            bail!(
                "frame size mismatch: expected {} bytes, got {}",
                self.frame_size,
                frame.data.len()
            );
        }

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("encoder stdin already closed"))?;

        stdin
            .write_all(&frame.data)
            .context("failed to write frame to ffmpeg stdin")?;
        self.frames_written += 1;

        Ok(())
    }

    pub fn finish(&mut self) -> Result<()> {
        drop(self.stdin.take());

        let status = self.child.wait().context("failed to wait for ffmpeg")?;

        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }

        if !status.success() {
            bail!("ffmpeg encoder exited with status {}", status);
        }

        debug!(
            output = %self.output_path.display(),
            frames = self.frames_written,
            "FFmpeg encoder finished successfully"
        );
        Ok(())
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        drop(self.stdin.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

impl FrameSink for VideoEncoder {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        VideoEncoder::write_frame(self, frame)
    }

    fn finish(&mut self) -> Result<()> {
        VideoEncoder::finish(self)
    }
}

/// Probe a finished output and check its video stream dimensions.
pub fn verify_output(output_path: &Path, expected_width: u32, expected_height: u32) -> Result<()> {
    let output = crate::runtime::command_for("ffprobe")
        .args(["-v", "quiet", "-print_format", "json", "-show_streams"])
        .arg(output_path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("failed to execute ffprobe for verification")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "ffprobe verification failed with status {}: {}",
            output.status,
            stderr.trim()
        );
    }

    let probe: serde_json::Value =
        serde_json::from_slice(&output.stdout).context("failed to parse ffprobe JSON")?;

    let video = probe["streams"]
        .as_array()
        .ok_or_else(|| anyhow!("ffprobe output missing streams array"))?
        .iter()
        .find(|s| s["codec_type"].as_str() == Some("video"))
        .ok_or_else(|| anyhow!("output file has no video stream"))?;

    let width = video["width"]
        .as_u64()
        .ok_or_else(|| anyhow!("video stream missing width"))?;
    let height = video["height"]
        .as_u64()
        .ok_or_else(|| anyhow!("video stream missing height"))?;

    if width != expected_width as u64 || height != expected_height as u64 {
        bail!(
            "output resolution mismatch: expected {}x{}, got {}x{}",
            expected_width,
            expected_height,
            width,
            height
        );
    }

    info!(
        path = %output_path.display(),
        width,
        height,
        codec = %video["codec_name"].as_str().unwrap_or("unknown"),
        tag = %video["codec_tag_string"].as_str().unwrap_or("unknown"),
        "output verification passed"
    );
    Ok(())
}
