use std::io::Read;
use std::path::Path;
use std::process::{Child, Stdio};
use std::thread::JoinHandle;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, warn};

use crate::pipeline::FrameSource;
use crate::runtime::{spawn_stderr_logger, FfmpegRole};
use crate::types::{Frame, VideoStreamInfo};

const FALLBACK_FPS: f64 = 23.976;
const FALLBACK_FPS_RATIONAL: &str = "24000/1001";

// ffprobe JSON model (serde)
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize, Debug)]
pub struct FfprobeOutput {
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: Option<FfprobeFormat>,
}

#[derive(serde::Deserialize, Debug)]
struct FfprobeStream {
    index: usize,
    codec_name: Option<String>,
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    pix_fmt: Option<String>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
    #[serde(default)]
    disposition: std::collections::HashMap<String, serde_json::Value>,
}

#[derive(serde::Deserialize, Debug)]
struct FfprobeFormat {
    duration: Option<String>,
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    let parts: Vec<&str> = s.split('/').collect();
    if parts.len() == 2 {
        let num: f64 = parts[0].parse().ok()?;
        let den: f64 = parts[1].parse().ok()?;
        if den > 0.0 {
            return Some(num / den);
        }
        return None;
    }
    s.parse().ok()
}

fn disposition_flag(stream: &FfprobeStream, key: &str) -> bool {
    stream
        .disposition
        .get(key)
        .and_then(|value| {
            value
                .as_bool()
                .or_else(|| value.as_i64().map(|n| n != 0))
                .or_else(|| value.as_str().map(|s| s != "0"))
        })
        .unwrap_or(false)
}

fn select_primary_video_stream(streams: &[FfprobeStream]) -> Option<&FfprobeStream> {
    streams
        .iter()
        .filter(|stream| stream.codec_type.as_deref() == Some("video"))
        .min_by_key(|stream| {
            let is_attached_picture = disposition_flag(stream, "attached_pic");
            let is_default = disposition_flag(stream, "default");
            (is_attached_picture, !is_default, stream.index)
        })
}

/// Container-reported frame count, else `duration × fps`. Progress only.
fn estimate_frame_count(
    stream: &FfprobeStream,
    format: Option<&FfprobeFormat>,
    fps: f64,
) -> Option<u64> {
    if let Some(n) = stream
        .nb_frames
        .as_deref()
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|n| *n > 0)
    {
        return Some(n);
    }

    let duration = stream
        .duration
        .as_deref()
        .or_else(|| format.and_then(|f| f.duration.as_deref()))
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)?;
    Some((duration * fps).round() as u64)
}

pub fn run_ffprobe(path: &Path) -> Result<FfprobeOutput> {
    let output = crate::runtime::command_for("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("failed to execute ffprobe (is FFmpeg installed?)")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        );
    }

    parse_ffprobe_json(&output.stdout)
}

pub fn parse_ffprobe_json(json: &[u8]) -> Result<FfprobeOutput> {
    serde_json::from_slice(json).context("failed to parse ffprobe JSON")
}

pub fn extract_stream_info(probe: &FfprobeOutput, source_path: &Path) -> Result<VideoStreamInfo> {
    let video_stream = select_primary_video_stream(&probe.streams)
        .ok_or_else(|| anyhow!("no video stream found"))?;

    let width = video_stream
        .width
        .filter(|w| *w > 0)
        .ok_or_else(|| anyhow!("video stream missing width"))?;
    let height = video_stream
        .height
        .filter(|h| *h > 0)
        .ok_or_else(|| anyhow!("video stream missing height"))?;

    let fps_str = video_stream
        .r_frame_rate
        .as_deref()
        .filter(|s| parse_frame_rate(s).is_some_and(|fps| fps > 0.0))
        .or(video_stream.avg_frame_rate.as_deref())
        .unwrap_or("0/0");
    let (fps, fps_rational) = match parse_frame_rate(fps_str) {
        Some(fps) if fps > 0.0 => (fps, fps_str.to_string()),
        _ => {
            warn!("could not determine frame rate (got {fps_str}), defaulting to {FALLBACK_FPS}");
            (FALLBACK_FPS, FALLBACK_FPS_RATIONAL.to_string())
        }
    };

    let frame_count = estimate_frame_count(video_stream, probe.format.as_ref(), fps);

    Ok(VideoStreamInfo {
        source_path: source_path.to_path_buf(),
        stream_index: video_stream.index,
        width,
        height,
        fps,
        fps_rational,
        codec_name: video_stream
            .codec_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        pix_fmt: video_stream
            .pix_fmt
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        frame_count,
    })
}

/// Probe a file and return its primary video stream.
pub fn probe_video(path: &Path) -> Result<VideoStreamInfo> {
    if !path.is_file() {
        bail!("input file does not exist: {}", path.display());
    }
    let probe = run_ffprobe(path)?;
    extract_stream_info(&probe, path)
}

fn build_decoder_args(path: &Path, stream_index: usize) -> Vec<String> {
    let mut args: Vec<String> = vec!["-nostdin".to_string()];
    args.push("-i".to_string());
    args.push(path.to_string_lossy().into_owned());
    args.extend([
        "-map".to_string(),
        format!("0:{stream_index}"),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "bgr24".to_string(),
        "-vsync".to_string(),
        "passthrough".to_string(),
        "-v".to_string(),
        "error".to_string(),
        "pipe:1".to_string(),
    ]);
    args
}

/// Decodes video to packed BGR24 frames via an FFmpeg subprocess, one frame
/// at a time. Stderr is drained on a background thread so the pipe never
/// fills. FFmpeg is killed and reaped on [`Drop`].
pub struct VideoDecoder {
    child: Child,
    info: VideoStreamInfo,
    frame_size: usize,
    frames_read: u64,
    stderr_thread: Option<JoinHandle<()>>,
    buf: Vec<u8>,
    eof: bool,
}

impl VideoDecoder {
    pub fn open(path: &Path, info: VideoStreamInfo) -> Result<Self> {
        let frame_size = Frame::byte_len(info.width, info.height);
        let args = build_decoder_args(path, info.stream_index);

        let mut child = crate::runtime::command_for("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg (is it installed?)")?;

        let stderr_thread = child
            .stderr
            .take()
            .map(|stderr| spawn_stderr_logger(stderr, FfmpegRole::Decode));

        debug!(
            input = %path.display(),
            width = info.width,
            height = info.height,
            fps = %info.fps_rational,
            "Decoder started"
        );

        Ok(Self {
            child,
            info,
            frame_size,
            frames_read: 0,
            stderr_thread,
            buf: vec![0u8; frame_size],
            eof: false,
        })
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        if self.eof {
            return Ok(None);
        }
        let stdout = self
            .child
            .stdout
            .as_mut()
            .ok_or_else(|| anyhow!("ffmpeg stdout not available"))?;

        let mut total_read = 0;
        while total_read < self.frame_size {
            match stdout.read(&mut self.buf[total_read..]) {
                Ok(0) => {
                    self.eof = true;
                    if total_read == 0 {
                        return Ok(None);
                    }
                    bail!(
                        "partial frame at EOF ({total_read}/{} bytes) after {} frames",
                        self.frame_size,
                        self.frames_read
                    );
                }
                Ok(n) => {
                    total_read += n;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    continue;
                }
                Err(e) => {
                    self.eof = true;
                    return Err(e).context("failed to read frame from ffmpeg stdout");
                }
            }
        }

        self.frames_read += 1;
        Frame::new(self.buf.clone(), self.info.width, self.info.height).map(Some)
    }

    /// Reap FFmpeg. At end of stream a non-zero exit means decoding failed
    /// somewhere mid-stream. Before end of stream the process is killed.
    pub fn finish(&mut self) -> Result<()> {
        if !self.eof {
            let _ = self.child.kill();
            let _ = self.child.wait();
            return Ok(());
        }
        let status = self.child.wait().context("failed to wait for ffmpeg")?;
        if !status.success() {
            bail!("ffmpeg decoder exited with status {}", status);
        }
        Ok(())
    }
}

impl FrameSource for VideoDecoder {
    fn info(&self) -> &VideoStreamInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.read_frame()
    }

    fn finish(&mut self) -> Result<()> {
        VideoDecoder::finish(self)
    }
}

impl Drop for VideoDecoder {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}
