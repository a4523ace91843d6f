//! Frame ↔ tensor conversion.
//!
//! Decoder/encoder side: packed BGR24, `(H, W, C)`.
//! Model side: RGB planes, `[1, 3, H, W]`, f32 normalized to `[0, 1]`.

use anyhow::{bail, ensure, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{Array4, ArrayD, IxDyn};

use crate::types::{Frame, BGR_CHANNELS};

const CHUNK: usize = 4096;

/// Packed BGR u8 → normalized RGB NCHW with a leading batch dimension of 1.
pub fn bgr_frame_to_nchw(frame: &Frame) -> Result<Array4<f32>> {
    let h = frame.height as usize;
    let w = frame.width as usize;
    let hw = h * w;
    let expected = hw * BGR_CHANNELS;
    if frame.data.len() != expected {
        bail!(
            "frame data length mismatch: expected {} ({}x{}x3), got {}",
            expected,
            h,
            w,
            frame.data.len()
        );
    }

    let mut planes = vec![0.0f32; 3 * hw];
    let (r_plane, rest) = planes.split_at_mut(hw);
    let (g_plane, b_plane) = rest.split_at_mut(hw);

    for (i, px) in frame.data.chunks_exact(BGR_CHANNELS).enumerate() {
        b_plane[i] = px[0] as f32 / 255.0;
        g_plane[i] = px[1] as f32 / 255.0;
        r_plane[i] = px[2] as f32 / 255.0;
    }

    Ok(Array4::from_shape_vec((1, 3, h, w), planes)?)
}

/// Normalized RGB NCHW (`[1, 3, H, W]`) → packed BGR u8.
///
/// Values are clamped to `[0, 1]` before scaling, then rounded to nearest.
pub fn nchw_to_bgr_frame(arr: &Array4<f32>) -> Result<Frame> {
    let shape = arr.shape();
    ensure!(
        shape[0] == 1 && shape[1] == 3,
        "expected model output of shape [1, 3, H, W], got {:?}",
        shape
    );
    let h = shape[2];
    let w = shape[3];
    let hw = h * w;

    let owned_contig;
    let slice = if let Some(s) = arr.as_slice() {
        s
    } else {
        owned_contig = arr.as_standard_layout().into_owned();
        match owned_contig.as_slice() {
            Some(s) => s,
            None => bail!("model output is not contiguous"),
        }
    };

    let r_plane = &slice[..hw];
    let g_plane = &slice[hw..2 * hw];
    let b_plane = &slice[2 * hw..3 * hw];

    let mut bgr = vec![0u8; hw * BGR_CHANNELS];
    let mut offset = 0;
    while offset < hw {
        let len = CHUNK.min(hw - offset);
        let dst = &mut bgr[offset * 3..(offset + len) * 3];
        for j in 0..len {
            dst[j * 3] = to_u8(b_plane[offset + j]);
            dst[j * 3 + 1] = to_u8(g_plane[offset + j]);
            dst[j * 3 + 2] = to_u8(r_plane[offset + j]);
        }
        offset += len;
    }

    Frame::new(bgr, w as u32, h as u32)
}

fn to_u8(v: f32) -> u8 {
    // NaN clamps to NaN and casts to 0.
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// f32 NCHW → f16 NCHW for models that declare half-precision input.
pub fn nchw_f32_to_f16(arr: &Array4<f32>) -> Result<ArrayD<f16>> {
    let contiguous = arr.as_standard_layout();
    let Some(f32_slice) = contiguous.as_slice() else {
        bail!("input tensor is not contiguous");
    };
    let mut fp16 = vec![f16::ZERO; f32_slice.len()];
    fp16.convert_from_f32_slice(f32_slice);
    Ok(ArrayD::from_shape_vec(IxDyn(arr.shape()), fp16)?)
}

/// f16 tensor (any rank-4 layout) → owned f32 NCHW.
pub fn nchw_f16_to_f32(arr: &ArrayD<f16>) -> Result<Array4<f32>> {
    ensure!(
        arr.ndim() == 4,
        "expected rank-4 tensor, got shape {:?}",
        arr.shape()
    );
    let contiguous = arr.as_standard_layout();
    let Some(fp16) = contiguous.as_slice() else {
        bail!("f16 tensor is not contiguous");
    };
    let mut f32_data = vec![0.0f32; fp16.len()];
    fp16.convert_to_f32_slice(&mut f32_data);
    let shape = arr.shape();
    Ok(Array4::from_shape_vec(
        (shape[0], shape[1], shape[2], shape[3]),
        f32_data,
    )?)
}
