//! Frame payloads carried by [`FrameStream`](super::FrameStream).
//!
//! Producers copy native buffers into these owned types before pushing them, so no
//! driver-owned memory ever reaches a consumer. Streams hand frames out as `Arc<T>`.

use crate::error::{AppResult, StationError};

/// Color image with tightly packed rows.
///
/// # Storage
/// `data.len() == width * height * bytes_per_pixel`; row stride is `width * bytes_per_pixel`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorImage {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Bytes per pixel (3 for RGB, 4 for BGRA)
    pub bytes_per_pixel: u32,
    /// Raw pixel data
    pub data: Vec<u8>,
}

impl ColorImage {
    /// Copy a native buffer into an owned image.
    pub fn from_raw(width: u32, height: u32, bytes_per_pixel: u32, raw: &[u8]) -> AppResult<Self> {
        let expected = width as usize * height as usize * bytes_per_pixel as usize;
        if raw.len() < expected {
            return Err(StationError::InvalidArgument(format!(
                "color buffer holds {} bytes, {}x{}x{} needs {}",
                raw.len(),
                width,
                height,
                bytes_per_pixel,
                expected
            )));
        }
        Ok(Self {
            width,
            height,
            bytes_per_pixel,
            data: raw[..expected].to_vec(),
        })
    }

    /// Solid-color image, mostly for tests and synthetic providers.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize * 3);
        for _ in 0..(width as usize * height as usize) {
            data.extend_from_slice(&rgb);
        }
        Self {
            width,
            height,
            bytes_per_pixel: 3,
            data,
        }
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.width as usize * self.bytes_per_pixel as usize
    }
}

/// Depth map in millimetres, row-major, 0 means "no reading".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepthMap {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Depth values
    pub data: Vec<i16>,
}

impl DepthMap {
    /// Copy a native buffer into an owned depth map.
    pub fn from_raw(width: u32, height: u32, raw: &[i16]) -> AppResult<Self> {
        let expected = width as usize * height as usize;
        if raw.len() < expected {
            return Err(StationError::InvalidArgument(format!(
                "depth buffer holds {} values, {}x{} needs {}",
                raw.len(),
                width,
                height,
                expected
            )));
        }
        Ok(Self {
            width,
            height,
            data: raw[..expected].to_vec(),
        })
    }

    /// Depth map with every pixel at `depth`.
    pub fn flat(width: u32, height: u32, depth: i16) -> Self {
        Self {
            width,
            height,
            data: vec![depth; width as usize * height as usize],
        }
    }

    /// Value at `(x, y)`, `None` when out of bounds.
    pub fn at(&self, x: u32, y: u32) -> Option<i16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }

    /// Total pixel count.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the map holds no pixels.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_from_raw_copies_and_trims() {
        let raw = vec![7u8; 2 * 2 * 3 + 5];
        let image = ColorImage::from_raw(2, 2, 3, &raw).unwrap();
        assert_eq!(image.data.len(), 12);
        assert_eq!(image.stride(), 6);
    }

    #[test]
    fn test_color_from_raw_rejects_short_buffer() {
        assert!(ColorImage::from_raw(4, 4, 3, &[0u8; 10]).is_err());
    }

    #[test]
    fn test_depth_access() {
        let mut map = DepthMap::flat(3, 2, 1000);
        map.data[4] = 900;
        assert_eq!(map.at(1, 1), Some(900));
        assert_eq!(map.at(3, 0), None);
        assert_eq!(map.len(), 6);
        assert!(DepthMap::from_raw(3, 3, &[0; 4]).is_err());
    }
}
