use std::time::Instant;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Pixel layouts exchanged with the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 8-bit 4:2:2 YCbCr packed as UYVY, the native capture format
    Yuv8Bit,
    /// 10-bit 4:2:2 YCbCr packed as v210
    Yuv10Bit,
    /// 8-bit ARGB
    Argb8Bit,
    /// 8-bit BGRA
    #[default]
    Bgra8Bit,
    /// 10-bit RGB packed big-endian as r210
    Rgb10Bit,
}

impl PixelFormat {
    /// Bytes per row with no padding beyond what the packing requires.
    pub fn row_bytes(self, width: u32) -> usize {
        let width = width as usize;
        match self {
            Self::Yuv8Bit => width.div_ceil(2) * 4,
            // v210 packs 6 pixels into 16 bytes, rows aligned to 128 bytes
            Self::Yuv10Bit => width.div_ceil(48) * 128,
            Self::Argb8Bit | Self::Bgra8Bit => width * 4,
            Self::Rgb10Bit => width.div_ceil(64) * 256,
        }
    }

    /// True for the 4-byte-per-pixel layouts a converter can target.
    pub fn is_four_byte(self) -> bool {
        matches!(self, Self::Argb8Bit | Self::Bgra8Bit)
    }
}

/// One video frame in CPU memory.
///
/// The byte buffer is resized lazily: it is only reallocated when the
/// reported dimensions or layout change.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    data: BytesMut,
    width: u32,
    height: u32,
    row_bytes: usize,
    format: PixelFormat,
    sequence: u64,
    captured_at: Option<Instant>,
}

impl Frame {
    /// Allocate a zeroed frame with tightly packed rows.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let mut frame = Self::default();
        frame.reshape(width, height, format.row_bytes(width), format);
        frame
    }

    /// Build a frame around existing packed bytes.
    ///
    /// Returns `None` when `data` is shorter than `row_bytes * height`.
    pub fn from_bytes(
        data: &[u8],
        width: u32,
        height: u32,
        row_bytes: usize,
        format: PixelFormat,
    ) -> Option<Self> {
        let len = row_bytes.checked_mul(height as usize)?;
        if data.len() < len {
            return None;
        }
        let mut frame = Self::default();
        frame.reshape(width, height, row_bytes, format);
        frame.data.copy_from_slice(&data[..len]);
        Some(frame)
    }

    /// Change the frame geometry, reallocating only if the byte size changed.
    pub fn reshape(&mut self, width: u32, height: u32, row_bytes: usize, format: PixelFormat) {
        let len = row_bytes * height as usize;
        if self.data.len() != len {
            self.data.resize(len, 0);
        }
        self.width = width;
        self.height = height;
        self.row_bytes = row_bytes;
        self.format = format;
    }

    /// Copy another frame into this one, reusing the allocation when possible.
    pub fn copy_from(&mut self, other: &Frame) {
        self.reshape(other.width, other.height, other.row_bytes, other.format);
        self.data.copy_from_slice(&other.data);
        self.sequence = other.sequence;
        self.captured_at = other.captured_at;
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn row_bytes(&self) -> usize {
        self.row_bytes
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Arrival counter assigned by the capture channel, starting at 1.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> Option<Instant> {
        self.captured_at
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// One row of pixel data, including any stride padding. `None` past the
    /// last row.
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        let start = y as usize * self.row_bytes;
        self.data.get(start..start + self.row_bytes)
    }

    /// Immutable copy of the pixel bytes that can be shared across threads.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }

    pub(crate) fn stamp(&mut self, sequence: u64, captured_at: Instant) {
        self.sequence = sequence;
        self.captured_at = Some(captured_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_bytes() {
        assert_eq!(PixelFormat::Yuv8Bit.row_bytes(1920), 3840);
        assert_eq!(PixelFormat::Bgra8Bit.row_bytes(1920), 7680);
        assert_eq!(PixelFormat::Yuv10Bit.row_bytes(1920), 5120);
        assert_eq!(PixelFormat::Rgb10Bit.row_bytes(1920), 7680);
    }

    #[test]
    fn test_reshape_keeps_allocation_when_size_matches() {
        let mut frame = Frame::new(4, 2, PixelFormat::Bgra8Bit);
        frame.as_bytes_mut()[0] = 7;
        frame.reshape(2, 4, 8, PixelFormat::Argb8Bit);
        assert_eq!(frame.as_bytes().len(), 32);
        assert_eq!(frame.as_bytes()[0], 7);
        assert_eq!(frame.format(), PixelFormat::Argb8Bit);
    }

    #[test]
    fn test_copy_from_resizes() {
        let src = Frame::from_bytes(&[1u8; 24], 3, 2, 12, PixelFormat::Bgra8Bit).unwrap();
        let mut dst = Frame::new(1, 1, PixelFormat::Bgra8Bit);
        dst.copy_from(&src);
        assert_eq!(dst.width(), 3);
        assert_eq!(dst.height(), 2);
        assert_eq!(dst.as_bytes(), src.as_bytes());
    }

    #[test]
    fn test_from_bytes_rejects_short_buffer() {
        assert!(Frame::from_bytes(&[0u8; 10], 2, 2, 8, PixelFormat::Bgra8Bit).is_none());
    }

    #[test]
    fn test_row_slices_by_stride() {
        let data: Vec<u8> = (0..16).collect();
        let frame = Frame::from_bytes(&data, 1, 2, 8, PixelFormat::Bgra8Bit).unwrap();
        assert_eq!(frame.row(1), Some(&data[8..16]));
        assert_eq!(frame.row(2), None);
    }
}
