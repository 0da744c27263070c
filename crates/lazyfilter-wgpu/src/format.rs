//! Pixel formats and CPU-side conversion to and from the working space
//!
//! The engine computes in premultiplied RGBA stored as 32-bit floats. Source
//! buffers are converted into that space before upload and rendered pixels are
//! converted out of it after readback.

use crate::region::Region;
use bytes::Bytes;

/// Pixel layouts accepted for sources and produced for results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PixelFormat {
    /// 8 bits per channel, normalized
    #[default]
    Rgba8Unorm,
    /// 16-bit IEEE half floats per channel
    Rgba16Float,
    /// 32-bit floats per channel
    Rgba32Float,
}

impl PixelFormat {
    /// Format of every texture the engine allocates
    pub const WORKING: PixelFormat = PixelFormat::Rgba32Float;

    /// Size of one RGBA pixel in bytes
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgba8Unorm => 4,
            PixelFormat::Rgba16Float => 8,
            PixelFormat::Rgba32Float => 16,
        }
    }

    /// Matching wgpu texture format
    pub fn to_wgpu(&self) -> wgpu::TextureFormat {
        match self {
            PixelFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            PixelFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            PixelFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        }
    }

    fn read_channel(&self, bytes: &[u8]) -> f32 {
        match self {
            PixelFormat::Rgba8Unorm => bytes[0] as f32 / 255.0,
            PixelFormat::Rgba16Float => half::f16::from_le_bytes([bytes[0], bytes[1]]).to_f32(),
            PixelFormat::Rgba32Float => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }

    fn write_channel(&self, value: f32, out: &mut Vec<u8>) {
        match self {
            PixelFormat::Rgba8Unorm => out.push((value.clamp(0.0, 1.0) * 255.0).round() as u8),
            PixelFormat::Rgba16Float => out.extend_from_slice(&half::f16::from_f32(value).to_le_bytes()),
            PixelFormat::Rgba32Float => out.extend_from_slice(&value.to_le_bytes()),
        }
    }
}

/// Whether color channels are stored multiplied by alpha
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AlphaMode {
    #[default]
    Premultiplied,
    Straight,
}

/// An in-memory source image placed at an origin in working space
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageBuffer {
    pub origin: (i32, i32),
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub alpha: AlphaMode,
    /// Tightly packed rows, top to bottom
    pub data: Bytes,
}

impl ImageBuffer {
    /// Wraps pixel data placed at the origin
    ///
    /// The data length is checked when the graph is compiled, not here.
    pub fn new(width: u32, height: u32, format: PixelFormat, alpha: AlphaMode, data: impl Into<Bytes>) -> Self {
        Self {
            origin: (0, 0),
            width,
            height,
            format,
            alpha,
            data: data.into(),
        }
    }

    /// Moves the image to a different origin
    pub fn with_origin(mut self, x: i32, y: i32) -> Self {
        self.origin = (x, y);
        self
    }

    /// Pixels covered by this image
    pub fn extent(&self) -> Region {
        Region::new(self.origin.0, self.origin.1, self.width, self.height)
    }

    /// Number of bytes the data must contain
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }

    /// Converts the pixels covering `region` into premultiplied working-space floats
    ///
    /// Pixels of `region` outside the image are transparent black. The caller must
    /// have checked the data length against [`ImageBuffer::expected_len`].
    pub fn to_working(&self, region: Region) -> Vec<f32> {
        let mut out = vec![0.0f32; region.area() as usize * 4];
        let Some(overlap) = region.intersection(&self.extent()) else {
            return out;
        };

        let bpp = self.format.bytes_per_pixel();
        let channel_size = bpp / 4;
        for y in overlap.y as i64..overlap.bottom() {
            for x in overlap.x as i64..overlap.right() {
                let src_index = ((y - self.origin.1 as i64) as usize * self.width as usize + (x - self.origin.0 as i64) as usize) * bpp;
                let dst_index = ((y - region.y as i64) as usize * region.width as usize + (x - region.x as i64) as usize) * 4;

                let mut pixel = [0.0f32; 4];
                for (c, value) in pixel.iter_mut().enumerate() {
                    let offset = src_index + c * channel_size;
                    *value = self.format.read_channel(&self.data[offset..offset + channel_size]);
                }
                if self.alpha == AlphaMode::Straight {
                    let a = pixel[3];
                    for value in &mut pixel[..3] {
                        *value *= a;
                    }
                }
                out[dst_index..dst_index + 4].copy_from_slice(&pixel);
            }
        }
        out
    }
}

/// Converts premultiplied working-space floats into the requested layout
pub fn encode_working(pixels: &[f32], format: PixelFormat, alpha: AlphaMode) -> Vec<u8> {
    let mut out = Vec::with_capacity(pixels.len() / 4 * format.bytes_per_pixel());
    for pixel in pixels.chunks_exact(4) {
        let a = pixel[3];
        for (c, &value) in pixel.iter().enumerate() {
            let value = match alpha {
                AlphaMode::Straight if c < 3 => {
                    if a > 0.0 {
                        value / a
                    } else {
                        0.0
                    }
                }
                _ => value,
            };
            format.write_channel(value, &mut out);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_straight_rgba8_to_working() {
        let image = ImageBuffer::new(2, 1, PixelFormat::Rgba8Unorm, AlphaMode::Straight, vec![255, 0, 0, 255, 255, 255, 255, 0]);
        let working = image.to_working(image.extent());
        assert_eq!(working, vec![1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_to_working_pads_outside_pixels() {
        let data: Vec<u8> = [0.5f32, 0.25, 0.0, 1.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let image = ImageBuffer::new(1, 1, PixelFormat::Rgba32Float, AlphaMode::Premultiplied, data).with_origin(1, 0);
        let working = image.to_working(Region::new(0, 0, 2, 1));
        assert_eq!(working, vec![0.0, 0.0, 0.0, 0.0, 0.5, 0.25, 0.0, 1.0]);
    }

    #[test]
    fn test_encode_unpremultiplies_for_straight_output() {
        let pixels = [0.25f32, 0.5, 0.0, 0.5];
        assert_eq!(encode_working(&pixels, PixelFormat::Rgba8Unorm, AlphaMode::Straight), vec![128, 255, 0, 128]);
        assert_eq!(encode_working(&pixels, PixelFormat::Rgba8Unorm, AlphaMode::Premultiplied), vec![64, 128, 0, 128]);
    }

    #[test]
    fn test_half_float_encoding() {
        let pixels = [1.0f32, 0.5, 0.25, 1.0];
        let encoded = encode_working(&pixels, PixelFormat::Rgba16Float, AlphaMode::Premultiplied);
        assert_eq!(encoded.len(), 8);
        let image = ImageBuffer::new(1, 1, PixelFormat::Rgba16Float, AlphaMode::Premultiplied, encoded);
        assert_eq!(image.to_working(image.extent()), pixels.to_vec());
    }
}
