//! Media decoding: turns image and animation files into frame sequences.

use image::codecs::gif::GifDecoder;
use image::{AnimationDecoder, RgbaImage};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::DeckError;

/// A decoded frame sequence. Static images are one-frame sources.
///
/// All frames are decoded up front and shared via Arc, so animation drivers
/// hand them out without copying pixel data.
#[derive(Debug)]
pub struct MediaSource {
    frames: Vec<Arc<RgbaImage>>,
    cursor: usize,
}

impl MediaSource {
    /// Decode a media file. GIF animations yield all their frames; any other
    /// readable raster format becomes a single-frame source.
    pub fn open(path: &Path) -> Result<Self, DeckError> {
        let bytes = std::fs::read(path)
            .map_err(|e| DeckError::ImageLoad(format!("{}: {e}", path.display())))?;

        // Try animated GIF first regardless of extension; fall back to a
        // static decode of the same bytes.
        if let Some(frames) = Self::decode_gif(&bytes) {
            debug!("Loaded {} frames from {}", frames.len(), path.display());
            return Ok(Self { frames, cursor: 0 });
        }

        let image = image::load_from_memory(&bytes)
            .map_err(|e| DeckError::ImageLoad(format!("{}: {e}", path.display())))?;
        debug!("Loaded static image from {}", path.display());
        Ok(Self {
            frames: vec![Arc::new(image.to_rgba8())],
            cursor: 0,
        })
    }

    /// Build a source from pre-decoded frames.
    pub fn from_frames(frames: Vec<Arc<RgbaImage>>) -> Self {
        Self { frames, cursor: 0 }
    }

    fn decode_gif(bytes: &[u8]) -> Option<Vec<Arc<RgbaImage>>> {
        let decoder = GifDecoder::new(Cursor::new(bytes)).ok()?;
        let mut frames = Vec::new();
        for frame in decoder.into_frames() {
            match frame {
                Ok(frame) => frames.push(Arc::new(frame.into_buffer())),
                Err(e) => {
                    warn!("Failed to decode GIF frame: {}", e);
                    break;
                }
            }
        }
        if frames.is_empty() {
            None
        } else {
            Some(frames)
        }
    }

    /// Next frame in sequence, or None when exhausted.
    pub fn next_frame(&mut self) -> Option<Arc<RgbaImage>> {
        let frame = self.frames.get(self.cursor)?;
        self.cursor += 1;
        Some(Arc::clone(frame))
    }

    /// Restart from the first frame (loop semantics).
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn is_animated(&self) -> bool {
        self.frames.len() > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn frame(tag: u8) -> Arc<RgbaImage> {
        Arc::new(RgbaImage::from_pixel(2, 2, Rgba([tag, 0, 0, 255])))
    }

    #[test]
    fn frames_come_back_in_order_and_rewind() {
        let mut source = MediaSource::from_frames(vec![frame(1), frame(2)]);
        assert!(source.is_animated());
        assert_eq!(source.next_frame().unwrap().get_pixel(0, 0)[0], 1);
        assert_eq!(source.next_frame().unwrap().get_pixel(0, 0)[0], 2);
        assert!(source.next_frame().is_none());
        source.rewind();
        assert_eq!(source.next_frame().unwrap().get_pixel(0, 0)[0], 1);
    }

    #[test]
    fn missing_file_is_image_load_error() {
        let err = MediaSource::open(Path::new("/nonexistent/deckhand.gif")).unwrap_err();
        assert!(matches!(err, DeckError::ImageLoad(_)));
    }

    #[test]
    fn static_png_becomes_single_frame() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tile.png");
        let img = RgbaImage::from_pixel(8, 8, Rgba([0, 128, 255, 255]));
        img.save(&path).expect("save");

        let mut source = MediaSource::open(&path).expect("open");
        assert_eq!(source.frame_count(), 1);
        assert!(!source.is_animated());
        let frame = source.next_frame().unwrap();
        assert_eq!(frame.get_pixel(0, 0)[2], 255);
    }
}
