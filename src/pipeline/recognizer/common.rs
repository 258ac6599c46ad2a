use anyhow::{Context, Result, anyhow};
use fast_image_resize as fir;
use ndarray::Array4;
use ort::session::{Session, builder::GraphOptimizationLevel};
use rayon::prelude::*;
use std::path::Path;

use crate::types::{Frame, Landmark};

#[derive(Clone, Debug)]
pub struct LetterboxInfo {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub orig_w: u32,
    pub orig_h: u32,
}

#[derive(Clone, Debug)]
pub struct CropTransform {
    pub center: (f32, f32),
    pub side: f32,
    pub angle: f32,
    pub output_size: u32,
    pub orig_w: u32,
    pub orig_h: u32,
}

/// Square region of interest in frame pixels, rotated by `angle` radians.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RegionOfInterest {
    pub center: (f32, f32),
    pub side: f32,
    pub angle: f32,
}

pub fn build_session(model_path: &Path, intra_threads: usize) -> Result<Session> {
    Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(intra_threads.max(1))?
        .commit_from_file(model_path)
        .with_context(|| format!("failed to load ORT session from {}", model_path.display()))
}

fn check_frame(frame: &Frame) -> Result<()> {
    let expected_len = (frame.width as usize)
        .saturating_mul(frame.height as usize)
        .saturating_mul(4);
    if frame.width == 0 || frame.height == 0 || frame.rgba.len() != expected_len {
        return Err(anyhow!(
            "frame buffer size mismatch: got {}, expected {} for {}x{}",
            frame.rgba.len(),
            expected_len,
            frame.width,
            frame.height
        ));
    }
    Ok(())
}

/// Letterboxes the whole frame into a `target_size` square NHWC tensor with
/// values in `[0, 1]`.
pub fn prepare_frame_with_size(
    frame: &Frame,
    target_size: u32,
) -> Result<(Array4<f32>, LetterboxInfo)> {
    check_frame(frame)?;

    let scale = target_size as f32 / (frame.width.max(frame.height) as f32);
    let new_w = ((frame.width as f32 * scale).round() as u32).clamp(1, target_size);
    let new_h = ((frame.height as f32 * scale).round() as u32).clamp(1, target_size);

    let src_image = fir::images::Image::from_vec_u8(
        frame.width,
        frame.height,
        frame.rgba.clone(),
        fir::PixelType::U8x4,
    )?;
    let mut dst_image = fir::images::Image::new(new_w, new_h, fir::PixelType::U8x4);
    let mut resizer = fir::Resizer::new();
    let resize_options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Interpolation(fir::FilterType::Bilinear));
    resizer
        .resize(&src_image, &mut dst_image, Some(&resize_options))
        .context("fast resize failed")?;
    let resized = dst_image.into_vec();

    let pad_x = ((target_size - new_w) / 2) as usize;
    let pad_y = ((target_size - new_h) / 2) as usize;
    let mut canvas = vec![0u8; (target_size as usize) * (target_size as usize) * 4];
    for px in canvas.chunks_mut(4) {
        px[3] = 255;
    }
    let dst_stride = target_size as usize * 4;
    let src_stride = new_w as usize * 4;
    for row in 0..(new_h as usize) {
        let dst_offset = (pad_y + row) * dst_stride + pad_x * 4;
        let src_offset = row * src_stride;
        canvas[dst_offset..dst_offset + src_stride]
            .copy_from_slice(&resized[src_offset..src_offset + src_stride]);
    }

    let normalized: Vec<f32> = canvas
        .par_chunks_exact(4)
        .flat_map_iter(|px| {
            [
                px[0] as f32 / 255.0,
                px[1] as f32 / 255.0,
                px[2] as f32 / 255.0,
            ]
        })
        .collect();
    let input = Array4::<f32>::from_shape_vec(
        (1, target_size as usize, target_size as usize, 3),
        normalized,
    )
    .map_err(|err| anyhow!("failed to build input tensor: {err}"))?;

    let letterbox = LetterboxInfo {
        scale,
        pad_x: pad_x as f32,
        pad_y: pad_y as f32,
        orig_w: frame.width,
        orig_h: frame.height,
    };

    Ok((input, letterbox))
}

/// Splits a flat model output into `count` rows of `stride` values.
pub fn decode_rows(flat: &[f32], count: usize, stride: usize) -> Result<Vec<&[f32]>> {
    if stride == 0 || flat.len() < count * stride {
        return Err(anyhow!(
            "unexpected landmarks length: got {}, need {}",
            flat.len(),
            count * stride
        ));
    }
    Ok(flat.chunks_exact(stride).take(count).collect())
}

impl LetterboxInfo {
    pub fn project(&self, x: f32, y: f32) -> (f32, f32) {
        let px = (x - self.pad_x) / self.scale;
        let py = (y - self.pad_y) / self.scale;
        (
            px.clamp(0.0, (self.orig_w.saturating_sub(1)) as f32),
            py.clamp(0.0, (self.orig_h.saturating_sub(1)) as f32),
        )
    }

    pub fn project_landmark(&self, x: f32, y: f32, z: f32, visibility: f32) -> Landmark {
        let (px, py) = self.project(x, y);
        Landmark::new(px, py, z / self.scale, visibility)
    }
}

/// Samples a rotated square crop of the frame into an NHWC tensor with
/// values in `[0, 1]`.
pub fn prepare_rotated_crop(
    frame: &Frame,
    roi: RegionOfInterest,
    output_size: u32,
) -> Result<(Array4<f32>, CropTransform)> {
    check_frame(frame)?;

    let half = output_size as f32 / 2.0;
    let scale = roi.side / output_size as f32;
    let cos = roi.angle.cos();
    let sin = roi.angle.sin();

    let data: Vec<f32> = (0..output_size)
        .into_par_iter()
        .flat_map_iter(|y| {
            let dy = (y as f32 + 0.5 - half) * scale;
            (0..output_size).flat_map(move |x| {
                let dx = (x as f32 + 0.5 - half) * scale;
                let src_x = roi.center.0 + dx * cos - dy * sin;
                let src_y = roi.center.1 + dx * sin + dy * cos;
                sample_rgb(frame, src_x, src_y)
            })
        })
        .collect();

    let array =
        Array4::<f32>::from_shape_vec((1, output_size as usize, output_size as usize, 3), data)
            .map_err(|err| anyhow!("failed to build rotated crop tensor: {err}"))?;

    let transform = CropTransform {
        center: roi.center,
        side: roi.side,
        angle: roi.angle,
        output_size,
        orig_w: frame.width,
        orig_h: frame.height,
    };

    Ok((array, transform))
}

impl CropTransform {
    pub fn project(&self, x: f32, y: f32) -> (f32, f32) {
        let half = self.output_size as f32 / 2.0;
        let scale = self.side / self.output_size as f32;
        let dx = (x - half) * scale;
        let dy = (y - half) * scale;
        let cos = self.angle.cos();
        let sin = self.angle.sin();
        let ox = self.center.0 + dx * cos - dy * sin;
        let oy = self.center.1 + dx * sin + dy * cos;
        (
            ox.clamp(0.0, (self.orig_w.saturating_sub(1)) as f32),
            oy.clamp(0.0, (self.orig_h.saturating_sub(1)) as f32),
        )
    }

    pub fn project_landmark(&self, x: f32, y: f32, z: f32) -> Landmark {
        let (px, py) = self.project(x, y);
        let scale = self.side / self.output_size as f32;
        Landmark::new(px, py, z * scale, 1.0)
    }
}

fn sample_rgb(frame: &Frame, x: f32, y: f32) -> [f32; 3] {
    if x.is_nan() || y.is_nan() {
        return [0.0, 0.0, 0.0];
    }
    let x0 = x.floor();
    let y0 = y.floor();
    let x1 = x0 + 1.0;
    let y1 = y0 + 1.0;

    let (w, h) = (frame.width as i32, frame.height as i32);
    let fetch = |cx: f32, cy: f32| -> [f32; 3] {
        let ix = cx as i32;
        let iy = cy as i32;
        if ix < 0 || iy < 0 || ix >= w || iy >= h {
            return [0.0, 0.0, 0.0];
        }
        let idx = ((iy as u32 * frame.width + ix as u32) as usize) * 4;
        [
            frame.rgba[idx] as f32 / 255.0,
            frame.rgba[idx + 1] as f32 / 255.0,
            frame.rgba[idx + 2] as f32 / 255.0,
        ]
    };

    let fx = x - x0;
    let fy = y - y0;
    let c00 = fetch(x0, y0);
    let c10 = fetch(x1, y0);
    let c01 = fetch(x0, y1);
    let c11 = fetch(x1, y1);

    let lerp = |a: f32, b: f32, t: f32| a + (b - a) * t;
    [
        lerp(lerp(c00[0], c10[0], fx), lerp(c01[0], c11[0], fx), fy),
        lerp(lerp(c00[1], c10[1], fx), lerp(c01[1], c11[1], fx), fy),
        lerp(lerp(c00[2], c10[2], fx), lerp(c01[2], c11[2], fx), fy),
    ]
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(width: u32, height: u32, rgb: [u8; 3]) -> Frame {
        let rgba = (0..width * height)
            .flat_map(|_| [rgb[0], rgb[1], rgb[2], 255])
            .collect();
        Frame::new(rgba, width, height)
    }

    #[test]
    fn test_letterbox_pads_short_side() {
        let frame = solid_frame(200, 100, [255, 0, 0]);
        let (input, letterbox) = prepare_frame_with_size(&frame, 64).unwrap();
        assert_eq!(input.shape(), &[1, 64, 64, 3]);
        assert_eq!(letterbox.pad_x, 0.0);
        assert_eq!(letterbox.pad_y, 16.0);
        assert_eq!(input[[0, 0, 0, 0]], 0.0);
        assert!((input[[0, 32, 32, 0]] - 1.0).abs() < 1e-3);

        let (x, y) = letterbox.project(32.0, 32.0);
        assert!((x - 100.0).abs() < 1e-3);
        assert!((y - 50.0).abs() < 1e-3);
    }

    #[test]
    fn test_rejects_mismatched_buffer() {
        let frame = Frame::new(vec![0u8; 10], 4, 4);
        assert!(prepare_frame_with_size(&frame, 32).is_err());
    }

    #[test]
    fn test_crop_transform_maps_center_and_rotation() {
        let transform = CropTransform {
            center: (100.0, 80.0),
            side: 64.0,
            angle: std::f32::consts::FRAC_PI_2,
            output_size: 32,
            orig_w: 640,
            orig_h: 480,
        };
        let (cx, cy) = transform.project(16.0, 16.0);
        assert!((cx - 100.0).abs() < 1e-3 && (cy - 80.0).abs() < 1e-3);

        // Crop +x maps to frame +y after a quarter turn.
        let (rx, ry) = transform.project(32.0, 16.0);
        assert!((rx - 100.0).abs() < 1e-3, "rx={rx}");
        assert!((ry - 112.0).abs() < 1e-3, "ry={ry}");
    }

    #[test]
    fn test_rotated_crop_samples_frame() {
        let frame = solid_frame(50, 50, [0, 255, 0]);
        let roi = RegionOfInterest {
            center: (25.0, 25.0),
            side: 20.0,
            angle: 0.3,
        };
        let (input, _) = prepare_rotated_crop(&frame, roi, 8).unwrap();
        assert_eq!(input.shape(), &[1, 8, 8, 3]);
        assert!((input[[0, 4, 4, 1]] - 1.0).abs() < 1e-3);
        assert_eq!(input[[0, 4, 4, 0]], 0.0);
    }

    #[test]
    fn test_decode_rows_checks_length() {
        let flat = [0.0f32; 10];
        assert_eq!(decode_rows(&flat, 2, 5).unwrap().len(), 2);
        assert!(decode_rows(&flat, 3, 5).is_err());
    }
}
