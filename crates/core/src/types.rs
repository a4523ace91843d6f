use std::path::PathBuf;

use anyhow::{bail, ensure, Result};

/// Bytes per packed BGR24 pixel.
pub const BGR_CHANNELS: usize = 3;

/// A decoded video frame: packed 8-bit BGR, row-major `(height, width, channel)`.
///
/// This is the layout FFmpeg emits for `-pix_fmt bgr24` and the layout the
/// encoder expects on stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = Self::byte_len(width, height);
        ensure!(
            data.len() == expected,
            "frame data length mismatch: expected {expected} ({width}x{height}x3), got {}",
            data.len()
        );
        Ok(Self {
            data,
            width,
            height,
        })
    }

    pub fn filled(width: u32, height: u32, bgr: [u8; 3]) -> Self {
        let mut data = Vec::with_capacity(Self::byte_len(width, height));
        for _ in 0..(width as usize * height as usize) {
            data.extend_from_slice(&bgr);
        }
        Self {
            data,
            width,
            height,
        }
    }

    pub fn byte_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * BGR_CHANNELS
    }

    /// `[b, g, r]` at pixel `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let idx = (y as usize * self.width as usize + x as usize) * BGR_CHANNELS;
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }
}

/// Properties of the primary video stream of an input file.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoStreamInfo {
    pub source_path: PathBuf,
    pub stream_index: usize,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Rational frame rate as reported by the container (e.g. "30000/1001").
    /// Passed verbatim to the encoder so the output rate matches exactly.
    pub fps_rational: String,
    pub codec_name: String,
    pub pix_fmt: String,
    /// Best-effort frame count, used only for progress reporting.
    pub frame_count: Option<u64>,
}

impl VideoStreamInfo {
    /// Output dimensions at `scale`. Errors instead of wrapping when either
    /// side does not fit in `u32`.
    pub fn scaled_dimensions(&self, scale: u32) -> Result<(u32, u32)> {
        match (self.width.checked_mul(scale), self.height.checked_mul(scale)) {
            (Some(width), Some(height)) => Ok((width, height)),
            _ => bail!(
                "{}x{} at scale {scale} exceeds the maximum frame size",
                self.width,
                self.height
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_new_validates_length() {
        assert!(Frame::new(vec![0u8; 2 * 2 * 3], 2, 2).is_ok());
        let err = Frame::new(vec![0u8; 11], 2, 2).unwrap_err();
        assert!(err.to_string().contains("length mismatch"));
    }

    #[test]
    fn test_frame_filled_and_pixel() {
        let frame = Frame::filled(3, 2, [10, 20, 30]);
        assert_eq!(frame.data.len(), 3 * 2 * 3);
        assert_eq!(frame.pixel(0, 0), [10, 20, 30]);
        assert_eq!(frame.pixel(2, 1), [10, 20, 30]);
    }

    #[test]
    fn test_scaled_dimensions() {
        let info = VideoStreamInfo {
            source_path: PathBuf::from("clip.mp4"),
            stream_index: 0,
            width: 480,
            height: 270,
            fps: 30.0,
            fps_rational: "30/1".to_string(),
            codec_name: "h264".to_string(),
            pix_fmt: "yuv420p".to_string(),
            frame_count: Some(10),
        };
        assert_eq!(info.scaled_dimensions(4).unwrap(), (1920, 1080));

        let huge = VideoStreamInfo {
            width: 1 << 30,
            ..info
        };
        let err = huge.scaled_dimensions(4).unwrap_err();
        assert!(err.to_string().contains("exceeds the maximum frame size"));
        assert_eq!(huge.scaled_dimensions(1).unwrap(), (1 << 30, 270));
    }
}
