//! Native-to-4-byte pixel conversion.

use crate::capture::frame::{Frame, PixelFormat};
use crate::error::{Error, Result};

/// Borrowed view of a packed source buffer.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub row_bytes: usize,
    pub format: PixelFormat,
}

impl<'a> FrameView<'a> {
    fn check_len(&self) -> Result<()> {
        let needed = self.row_bytes * self.height as usize;
        if self.data.len() < needed || self.row_bytes < self.format.row_bytes(self.width) {
            return Err(Error::Conversion(format!(
                "source buffer too small: {} bytes for {}x{} {:?}",
                self.data.len(),
                self.width,
                self.height,
                self.format
            )));
        }
        Ok(())
    }
}

/// Stateless pixel conversion, invoked once per captured frame when a
/// converted surface is requested.
pub trait PixelConverter: Send + Sync {
    /// Convert `src` into `dst`, reshaping `dst` to `src`'s size in `target`.
    fn convert(&self, src: FrameView<'_>, dst: &mut Frame, target: PixelFormat) -> Result<()>;
}

/// Portable CPU converter covering the formats capture negotiates.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftwareConverter;

impl PixelConverter for SoftwareConverter {
    fn convert(&self, src: FrameView<'_>, dst: &mut Frame, target: PixelFormat) -> Result<()> {
        if !target.is_four_byte() {
            return Err(Error::Conversion(format!(
                "unsupported target format {:?}",
                target
            )));
        }
        if src.format == PixelFormat::Yuv10Bit {
            return Err(Error::Conversion(
                "10-bit YUV conversion is not supported".into(),
            ));
        }
        src.check_len()?;
        dst.reshape(src.width, src.height, target.row_bytes(src.width), target);
        let dst_row_bytes = dst.row_bytes();
        let width = src.width as usize;

        for y in 0..src.height as usize {
            let src_row = &src.data[y * src.row_bytes..][..src.format.row_bytes(src.width)];
            let dst_row = &mut dst.as_bytes_mut()[y * dst_row_bytes..][..width * 4];
            match src.format {
                PixelFormat::Yuv8Bit => uyvy_row(src_row, dst_row, target),
                PixelFormat::Rgb10Bit => r210_row(src_row, dst_row, target),
                _ => reorder_row(src_row, src.format, dst_row, target),
            }
        }
        Ok(())
    }
}

fn write_pixel(out: &mut [u8], target: PixelFormat, r: u8, g: u8, b: u8) {
    match target {
        PixelFormat::Argb8Bit => out.copy_from_slice(&[255, r, g, b]),
        _ => out.copy_from_slice(&[b, g, r, 255]),
    }
}

/// BT.709 video-range YCbCr to 8-bit RGB.
fn ycbcr_to_rgb(y: u8, cb: u8, cr: u8) -> (u8, u8, u8) {
    let y = (y as f32 - 16.0) / 219.0;
    let cb = (cb as f32 - 128.0) / 224.0;
    let cr = (cr as f32 - 128.0) / 224.0;

    let r = y + 1.5748 * cr;
    let g = y - 0.1873 * cb - 0.4681 * cr;
    let b = y + 1.8556 * cb;

    let to_u8 = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    (to_u8(r), to_u8(g), to_u8(b))
}

fn uyvy_row(src: &[u8], dst: &mut [u8], target: PixelFormat) {
    for (x, out) in dst.chunks_exact_mut(4).enumerate() {
        let pair = &src[(x / 2) * 4..][..4];
        let (cb, cr) = (pair[0], pair[2]);
        let luma = if x % 2 == 0 { pair[1] } else { pair[3] };
        let (r, g, b) = ycbcr_to_rgb(luma, cb, cr);
        write_pixel(out, target, r, g, b);
    }
}

fn r210_row(src: &[u8], dst: &mut [u8], target: PixelFormat) {
    for (word, out) in src.chunks_exact(4).zip(dst.chunks_exact_mut(4)) {
        let packed = u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
        let r = ((packed >> 20) & 0x3ff) >> 2;
        let g = ((packed >> 10) & 0x3ff) >> 2;
        let b = (packed & 0x3ff) >> 2;
        write_pixel(out, target, r as u8, g as u8, b as u8);
    }
}

fn reorder_row(src: &[u8], from: PixelFormat, dst: &mut [u8], target: PixelFormat) {
    if from == target {
        dst.copy_from_slice(&src[..dst.len()]);
        return;
    }
    for (px, out) in src.chunks_exact(4).zip(dst.chunks_exact_mut(4)) {
        // ARGB <-> BGRA is a full byte reversal
        out.copy_from_slice(&[px[3], px[2], px[1], px[0]]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(data: &[u8], width: u32, height: u32, format: PixelFormat) -> FrameView<'_> {
        FrameView {
            data,
            width,
            height,
            row_bytes: format.row_bytes(width),
            format,
        }
    }

    #[test]
    fn test_uyvy_black_and_white() {
        // two pixels: black then white, neutral chroma
        let src = [128u8, 16, 128, 235];
        let mut dst = Frame::default();
        SoftwareConverter
            .convert(view(&src, 2, 1, PixelFormat::Yuv8Bit), &mut dst, PixelFormat::Bgra8Bit)
            .unwrap();
        assert_eq!(dst.as_bytes(), &[0, 0, 0, 255, 255, 255, 255, 255]);
        assert_eq!(dst.row_bytes(), 8);
    }

    #[test]
    fn test_uyvy_to_argb_order() {
        let src = [128u8, 235, 128, 235];
        let mut dst = Frame::default();
        SoftwareConverter
            .convert(view(&src, 2, 1, PixelFormat::Yuv8Bit), &mut dst, PixelFormat::Argb8Bit)
            .unwrap();
        assert_eq!(&dst.as_bytes()[..4], &[255, 255, 255, 255]);
    }

    #[test]
    fn test_bgra_to_argb_reorders() {
        let src = [1u8, 2, 3, 4];
        let mut dst = Frame::default();
        SoftwareConverter
            .convert(view(&src, 1, 1, PixelFormat::Bgra8Bit), &mut dst, PixelFormat::Argb8Bit)
            .unwrap();
        assert_eq!(dst.as_bytes(), &[4, 3, 2, 1]);
    }

    #[test]
    fn test_r210_full_scale() {
        let packed: u32 = (0x3ff << 20) | (0x200 << 10);
        let src = packed.to_be_bytes();
        let mut dst = Frame::default();
        // r210 rows are padded to 256 bytes
        let mut row = vec![0u8; PixelFormat::Rgb10Bit.row_bytes(1)];
        row[..4].copy_from_slice(&src);
        SoftwareConverter
            .convert(view(&row, 1, 1, PixelFormat::Rgb10Bit), &mut dst, PixelFormat::Bgra8Bit)
            .unwrap();
        assert_eq!(dst.as_bytes(), &[0, 128, 255, 255]);
    }

    #[test]
    fn test_short_source_rejected() {
        let src = [0u8; 4];
        let mut dst = Frame::default();
        let err = SoftwareConverter
            .convert(view(&src, 4, 4, PixelFormat::Yuv8Bit), &mut dst, PixelFormat::Bgra8Bit)
            .unwrap_err();
        assert!(matches!(err, Error::Conversion(_)));
    }

    #[test]
    fn test_non_four_byte_target_rejected() {
        let src = [0u8; 4];
        let mut dst = Frame::default();
        assert!(SoftwareConverter
            .convert(view(&src, 2, 1, PixelFormat::Yuv8Bit), &mut dst, PixelFormat::Yuv8Bit)
            .is_err());
    }
}
