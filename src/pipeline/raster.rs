use image::{ExtendedColorType, codecs::jpeg::JpegEncoder};

use crate::types::Frame;

/// Quality used by the browser dashboard (`toBlob(..., 0.8)`).
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Rasterizes a frame at its native resolution and compresses it to JPEG.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> anyhow::Result<Vec<u8>> {
    let expected_len = (frame.width as usize)
        .saturating_mul(frame.height as usize)
        .saturating_mul(3);
    if frame.width == 0 || frame.height == 0 {
        anyhow::bail!("cannot encode an empty {}x{} frame", frame.width, frame.height);
    }
    if frame.rgb.len() != expected_len {
        anyhow::bail!(
            "frame buffer size mismatch: got {}, expected {}",
            frame.rgb.len(),
            expected_len
        );
    }

    let mut jpeg = Vec::with_capacity(expected_len / 8);
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100));
    encoder.encode(&frame.rgb, frame.width, frame.height, ExtendedColorType::Rgb8)?;
    Ok(jpeg)
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn frame(width: u32, height: u32, len: usize) -> Frame {
        Frame {
            rgb: vec![128; len],
            width,
            height,
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn encodes_native_resolution_frame_as_jpeg() {
        let jpeg = encode_jpeg(&frame(16, 8, 16 * 8 * 3), DEFAULT_JPEG_QUALITY).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn rejects_mismatched_buffers() {
        assert!(encode_jpeg(&frame(4, 4, 10), DEFAULT_JPEG_QUALITY).is_err());
        assert!(encode_jpeg(&frame(0, 4, 0), DEFAULT_JPEG_QUALITY).is_err());
    }
}
