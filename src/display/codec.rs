//! Tile → device-native frame encoding.

use image::codecs::jpeg::JpegEncoder;
use image::{imageops, ExtendedColorType, ImageEncoder, RgbImage};

use crate::device::{FrameEncoding, FrameMirror, FrameRotation, KeyImageFormat, NativeFrame};
use crate::error::DeckError;

const JPEG_QUALITY: u8 = 95;

/// Encode a composed tile into the device's native per-key format.
///
/// Pure and deterministic: the same tile and format always produce
/// byte-identical output. Orientation is baked into the pixel data before
/// encoding.
pub fn encode_native(tile: &RgbImage, format: &KeyImageFormat) -> Result<NativeFrame, DeckError> {
    if (tile.width(), tile.height()) != format.size {
        return Err(DeckError::UnsupportedFormat(format!(
            "tile is {}x{}, device expects {}x{}",
            tile.width(),
            tile.height(),
            format.size.0,
            format.size.1
        )));
    }

    let oriented = orient(tile, format.rotation, format.mirror);
    let size = (oriented.width(), oriented.height());

    let bytes = match format.encoding {
        FrameEncoding::Jpeg => {
            let mut out = Vec::new();
            let encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
            encoder
                .write_image(
                    oriented.as_raw(),
                    size.0,
                    size.1,
                    ExtendedColorType::Rgb8,
                )
                .map_err(|e| DeckError::UnsupportedFormat(format!("jpeg encode: {e}")))?;
            out
        }
        FrameEncoding::Rgb => oriented.into_raw(),
        FrameEncoding::Bgr => {
            let mut raw = oriented.into_raw();
            for px in raw.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            raw
        }
    };

    Ok(NativeFrame {
        bytes: bytes.into(),
        size,
    })
}

fn orient(tile: &RgbImage, rotation: FrameRotation, mirror: FrameMirror) -> RgbImage {
    let rotated = match rotation {
        FrameRotation::Rot0 => tile.clone(),
        FrameRotation::Rot90 => imageops::rotate90(tile),
        FrameRotation::Rot180 => imageops::rotate180(tile),
        FrameRotation::Rot270 => imageops::rotate270(tile),
    };
    match mirror {
        FrameMirror::None => rotated,
        FrameMirror::Horizontal => imageops::flip_horizontal(&rotated),
        FrameMirror::Vertical => imageops::flip_vertical(&rotated),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn format(encoding: FrameEncoding) -> KeyImageFormat {
        KeyImageFormat {
            size: (72, 72),
            encoding,
            rotation: FrameRotation::Rot0,
            mirror: FrameMirror::None,
        }
    }

    fn test_tile() -> RgbImage {
        RgbImage::from_fn(72, 72, |x, y| Rgb([x as u8, y as u8, 99]))
    }

    #[test]
    fn encoding_is_deterministic() {
        let tile = test_tile();
        let fmt = format(FrameEncoding::Jpeg);
        let a = encode_native(&tile, &fmt).expect("encode");
        let b = encode_native(&tile, &fmt).expect("encode");
        assert_eq!(a, b);
    }

    #[test]
    fn bgr_swaps_channel_order() {
        let tile = RgbImage::from_pixel(72, 72, Rgb([1, 2, 3]));
        let frame = encode_native(&tile, &format(FrameEncoding::Bgr)).expect("encode");
        assert_eq!(&frame.bytes[..3], &[3, 2, 1]);
    }

    #[test]
    fn rgb_passes_raw_pixels_through() {
        let tile = RgbImage::from_pixel(72, 72, Rgb([7, 8, 9]));
        let frame = encode_native(&tile, &format(FrameEncoding::Rgb)).expect("encode");
        assert_eq!(frame.bytes.len(), 72 * 72 * 3);
        assert_eq!(&frame.bytes[..3], &[7, 8, 9]);
    }

    #[test]
    fn rotation_reorients_pixels() {
        let mut tile = RgbImage::from_pixel(72, 72, Rgb([0, 0, 0]));
        tile.put_pixel(0, 0, Rgb([255, 0, 0]));
        let fmt = KeyImageFormat {
            size: (72, 72),
            encoding: FrameEncoding::Rgb,
            rotation: FrameRotation::Rot180,
            mirror: FrameMirror::None,
        };
        let frame = encode_native(&tile, &fmt).expect("encode");
        // Top-left lands at bottom-right after Rot180.
        let last = frame.bytes.len() - 3;
        assert_eq!(&frame.bytes[last..], &[255, 0, 0]);
    }

    #[test]
    fn size_mismatch_is_unsupported() {
        let tile = RgbImage::new(64, 64);
        let err = encode_native(&tile, &format(FrameEncoding::Jpeg)).unwrap_err();
        assert!(matches!(err, DeckError::UnsupportedFormat(_)));
    }
}
