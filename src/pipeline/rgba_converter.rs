use std::convert::TryFrom;

use anyhow::{Result, anyhow};
#[cfg(feature = "camera-nokhwa")]
use nokhwa::{Buffer, utils::FrameFormat};
use rayon::prelude::*;
use yuv::{
    YuvBiPlanarImage, YuvConversionMode, YuvPackedImage, YuvRange, YuvStandardMatrix,
    yuv_nv12_to_rgba, yuyv422_to_rgba,
};
use zune_jpeg::{
    JpegDecoder,
    zune_core::{bytestream::ZCursor, colorspace::ColorSpace, options::DecoderOptions},
};

use crate::types::ImageFormat;

#[derive(Debug)]
pub struct RgbaFrame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

#[cfg(feature = "camera-nokhwa")]
pub fn convert_camera_frame(frame: &Buffer) -> Result<RgbaFrame> {
    let resolution = frame.resolution();
    let width = resolution.width_x;
    let height = resolution.height_y;
    let data = frame.buffer();

    let rgba = match frame.source_frame_format() {
        FrameFormat::NV12 => nv12_to_rgba(data, width, height)?,
        FrameFormat::YUYV => yuyv_to_rgba(data, width, height)?,
        FrameFormat::MJPEG => mjpeg_to_rgba(data)?,
        FrameFormat::RAWRGB => rgb_like_to_rgba(data, width, height, false)?,
        FrameFormat::RAWBGR => rgb_like_to_rgba(data, width, height, true)?,
        FrameFormat::GRAY => gray_to_rgba(data, width, height)?,
    };

    Ok(RgbaFrame {
        rgba,
        width,
        height,
    })
}

/// Converts a caller-owned buffer in `format` to RGBA.
pub fn convert_host_frame(
    format: ImageFormat,
    data: &[u8],
    width: u32,
    height: u32,
) -> Result<RgbaFrame> {
    let rgba = match format {
        ImageFormat::Bgr => rgb_like_to_rgba(data, width, height, true)?,
        ImageFormat::Rgb => rgb_like_to_rgba(data, width, height, false)?,
        ImageFormat::Bgra => rgba_like_to_rgba(data, width, height, true)?,
        ImageFormat::Rgba => rgba_like_to_rgba(data, width, height, false)?,
        ImageFormat::Gray => gray_to_rgba(data, width, height)?,
        ImageFormat::Nv12 => nv12_to_rgba(data, width, height)?,
        ImageFormat::Yuyv => yuyv_to_rgba(data, width, height)?,
    };

    Ok(RgbaFrame {
        rgba,
        width,
        height,
    })
}

/// Bytes of a tightly packed NV12 frame: full luma plane plus interleaved
/// chroma at half resolution, rounded up for odd sizes.
pub(crate) fn nv12_len(width: u32, height: u32) -> usize {
    let luma = width as usize * height as usize;
    luma + chroma_row_len(width) * (height as usize).div_ceil(2)
}

/// Row length of a YUYV frame; two pixels share four bytes.
pub(crate) fn yuyv_stride(width: u32) -> usize {
    (width as usize).div_ceil(2) * 4
}

fn chroma_row_len(width: u32) -> usize {
    (width as usize).div_ceil(2) * 2
}

fn checked_input<'a>(label: &str, data: &'a [u8], expected_len: usize) -> Result<&'a [u8]> {
    data.get(..expected_len).ok_or_else(|| {
        anyhow!(
            "{label} buffer too small: got {}, expected {expected_len}",
            data.len()
        )
    })
}

fn nv12_to_rgba(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let data = checked_input("NV12", data, nv12_len(width, height))?;
    let (y_plane, uv_plane) = data.split_at(width as usize * height as usize);
    let mut rgba = vec![0u8; width as usize * height as usize * 4];

    let image = YuvBiPlanarImage {
        y_plane,
        y_stride: width,
        uv_plane,
        uv_stride: chroma_row_len(width) as u32,
        width,
        height,
    };
    yuv_nv12_to_rgba(
        &image,
        &mut rgba,
        width * 4,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
        YuvConversionMode::Balanced,
    )
    .map_err(|err| anyhow!("NV12 to RGBA failed: {err:?}"))?;

    Ok(rgba)
}

fn yuyv_to_rgba(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let stride = yuyv_stride(width);
    let data = checked_input("YUYV", data, stride * height as usize)?;
    let mut rgba = vec![0u8; width as usize * height as usize * 4];

    let packed = YuvPackedImage {
        yuy: data,
        yuy_stride: stride as u32,
        width,
        height,
    };
    yuyv422_to_rgba(
        &packed,
        &mut rgba,
        width * 4,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
    )
    .map_err(|err| anyhow!("YUYV to RGBA failed: {err:?}"))?;

    Ok(rgba)
}

#[cfg_attr(not(feature = "camera-nokhwa"), allow(dead_code))]
fn mjpeg_to_rgba(data: &[u8]) -> Result<Vec<u8>> {
    let options = DecoderOptions::default().jpeg_set_out_colorspace(ColorSpace::RGBA);
    let mut decoder = JpegDecoder::new_with_options(ZCursor::new(data), options);
    let rgba = decoder
        .decode()
        .map_err(|err| anyhow!("MJPEG decode failed: {err:?}"))?;

    if let Some(info) = decoder.info() {
        let expected_len = usize::try_from(info.width)
            .and_then(|w| usize::try_from(info.height).map(|h| w * h * 4))
            .map_err(|_| anyhow!("MJPEG dimensions do not fit usize"))?;
        checked_input("MJPEG output", &rgba, expected_len)?;
    }

    Ok(rgba)
}

fn rgb_like_to_rgba(data: &[u8], width: u32, height: u32, swap_rb: bool) -> Result<Vec<u8>> {
    let pixels = width as usize * height as usize;
    let data = checked_input("RGB", data, pixels * 3)?;
    let (r, b) = if swap_rb { (2, 0) } else { (0, 2) };

    let mut rgba = vec![0u8; pixels * 4];
    rgba.par_chunks_mut(4)
        .zip(data.par_chunks_exact(3))
        .for_each(|(dst, src)| dst.copy_from_slice(&[src[r], src[1], src[b], 255]));

    Ok(rgba)
}

fn rgba_like_to_rgba(data: &[u8], width: u32, height: u32, swap_rb: bool) -> Result<Vec<u8>> {
    let data = checked_input("RGBA", data, width as usize * height as usize * 4)?;

    let mut rgba = data.to_vec();
    if swap_rb {
        rgba.par_chunks_mut(4).for_each(|px| px.swap(0, 2));
    }

    Ok(rgba)
}

fn gray_to_rgba(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let data = checked_input("GRAY", data, width as usize * height as usize)?;

    let mut rgba = vec![0u8; data.len() * 4];
    rgba.par_chunks_mut(4)
        .zip(data.par_iter().copied())
        .for_each(|(dst, value)| dst.copy_from_slice(&[value, value, value, 255]));

    Ok(rgba)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bgr_swaps_channels() {
        let bgr = [10u8, 20, 30, 40, 50, 60];
        let frame = convert_host_frame(ImageFormat::Bgr, &bgr, 2, 1).unwrap();
        assert_eq!(frame.rgba, vec![30, 20, 10, 255, 60, 50, 40, 255]);
    }

    #[test]
    fn test_bgra_keeps_alpha() {
        let bgra = [1u8, 2, 3, 4];
        let frame = convert_host_frame(ImageFormat::Bgra, &bgra, 1, 1).unwrap();
        assert_eq!(frame.rgba, vec![3, 2, 1, 4]);
    }

    #[test]
    fn test_gray_expands() {
        let frame = convert_host_frame(ImageFormat::Gray, &[7u8, 9], 2, 1).unwrap();
        assert_eq!(frame.rgba, vec![7, 7, 7, 255, 9, 9, 9, 255]);
    }

    #[test]
    fn test_short_buffer_is_rejected() {
        let err = convert_host_frame(ImageFormat::Rgb, &[0u8; 5], 2, 1).unwrap_err();
        assert!(err.to_string().contains("too small"));
        assert!(convert_host_frame(ImageFormat::Nv12, &[0u8; 4], 2, 2).is_err());
    }

    #[test]
    fn test_odd_sized_yuv_layouts_round_up_chroma() {
        assert_eq!(nv12_len(4, 2), 12);
        assert_eq!(nv12_len(3, 3), 9 + 4 * 2);
        assert_eq!(yuyv_stride(4), 8);
        assert_eq!(yuyv_stride(3), 8);
    }
}
