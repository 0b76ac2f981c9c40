//! Frame encoding for transmission.
//!
//! Converts the newest captured frame into a base64 JPEG data URI at a fixed
//! quality. There is no quality negotiation with the server.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::frame::VideoFrame;
use crate::protocol::{encode_data_uri, JPEG_MIME};

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

#[derive(Clone, Copy, Debug)]
pub struct FrameEncoder {
    quality: u8,
}

impl FrameEncoder {
    pub fn new(quality: u8) -> Result<Self> {
        if !(1..=100).contains(&quality) {
            return Err(anyhow!("jpeg quality must be within 1..=100, got {}", quality));
        }
        Ok(Self { quality })
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Compress `frame` to JPEG bytes.
    pub fn encode_jpeg(&self, frame: &VideoFrame) -> Result<Vec<u8>> {
        let mut jpeg = Vec::with_capacity(frame.pixels().len() / 8);
        JpegEncoder::new_with_quality(&mut jpeg, self.quality)
            .encode(
                frame.pixels(),
                frame.width,
                frame.height,
                ExtendedColorType::Rgb8,
            )
            .with_context(|| format!("encode {}x{} frame", frame.width, frame.height))?;
        Ok(jpeg)
    }

    /// Compress `frame` and wrap it as a `data:image/jpeg;base64,...` URI.
    pub fn encode_data_uri(&self, frame: &VideoFrame) -> Result<String> {
        let jpeg = self.encode_jpeg(frame)?;
        Ok(encode_data_uri(JPEG_MIME, &jpeg))
    }
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self {
            quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_data_uri;
    use image::GenericImageView;

    fn gradient_frame(width: u32, height: u32) -> VideoFrame {
        let mut pixels = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.extend_from_slice(&[(x * 8) as u8, (y * 8) as u8, 128]);
            }
        }
        VideoFrame::from_rgb(pixels, width, height, 1).expect("valid frame")
    }

    #[test]
    fn rejects_out_of_range_quality() {
        assert!(FrameEncoder::new(0).is_err());
        assert!(FrameEncoder::new(101).is_err());
        assert_eq!(FrameEncoder::new(80).map(|e| e.quality()).ok(), Some(80));
    }

    #[test]
    fn produces_decodable_jpeg_data_uri() -> Result<()> {
        let encoder = FrameEncoder::default();
        let uri = encoder.encode_data_uri(&gradient_frame(16, 8))?;
        assert!(uri.starts_with("data:image/jpeg;base64,"));

        let decoded = decode_data_uri(&uri)?;
        assert_eq!(&decoded.payload[..2], &[0xFF, 0xD8]);
        let image = image::load_from_memory(&decoded.payload)?;
        assert_eq!(image.dimensions(), (16, 8));
        Ok(())
    }
}
