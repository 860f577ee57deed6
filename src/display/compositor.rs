//! Pure image composition: key tiles, background slicing, shrink feedback.
//!
//! Nothing in here touches the device or spawns tasks; every function is a
//! deterministic transform so composed tiles can be compared byte-for-byte
//! in tests.

use image::imageops::{self, FilterType};
use image::{DynamicImage, Pixel, Rgb, RgbImage, Rgba, RgbaImage};
use rusttype::{point, Font, Scale};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::fonts::FontStore;
use crate::device::KeyLayout;
use crate::error::DeckError;

/// Bezel gap between adjacent key displays, in full-deck-image pixels.
pub const DEFAULT_KEY_SPACING: (u32, u32) = (36, 36);

/// Shrink feedback scales the tile content by 25/36 (72 → 50) and recenters
/// it on black.
const SHRINK_NUM: u32 = 25;
const SHRINK_DEN: u32 = 36;

/// Margins around the base image inside a tile: left, top, right, bottom.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Margins {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

/// One text label drawn at a fixed anchor of a tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub text: String,
    /// Font file; falls back to the configured default, then system fonts.
    pub font: Option<PathBuf>,
    pub size: f32,
    /// RGBA fill color.
    pub color: [u8; 4],
    pub stroke_width: u32,
}

impl Default for Label {
    fn default() -> Self {
        Self {
            text: String::new(),
            font: None,
            size: 18.0,
            color: [255, 255, 255, 255],
            stroke_width: 0,
        }
    }
}

/// Labels for the three anchors of one key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelSet {
    pub top: Option<Label>,
    pub center: Option<Label>,
    pub bottom: Option<Label>,
}

impl LabelSet {
    pub fn is_empty(&self) -> bool {
        self.top.is_none() && self.center.is_none() && self.bottom.is_none()
    }
}

/// Compose one key tile: scaled base image and labels on a transparent
/// canvas, alpha-composited over the background tile (or black), optionally
/// shrunk for press feedback.
pub fn compose_key_tile(
    base: Option<&DynamicImage>,
    labels: &LabelSet,
    fonts: &FontStore,
    margins: Margins,
    background: Option<&RgbImage>,
    tile_size: (u32, u32),
    shrink: bool,
) -> Result<RgbImage, DeckError> {
    let foreground = compose_foreground(base, labels, fonts, margins, tile_size)?;
    Ok(flatten_tile(
        Some(&foreground),
        background,
        tile_size,
        shrink,
    ))
}

/// Build the transparent foreground canvas for a key: the scaled base image
/// pasted at the margin offset plus all labels. This is the tile the
/// controller stores per key; the background is composited underneath at
/// flatten time so background swaps never require re-scaling the source.
pub fn compose_foreground(
    base: Option<&DynamicImage>,
    labels: &LabelSet,
    fonts: &FontStore,
    margins: Margins,
    tile_size: (u32, u32),
) -> Result<RgbaImage, DeckError> {
    let (tile_w, tile_h) = tile_size;
    if tile_w == 0 || tile_h == 0 {
        return Err(DeckError::InvalidGeometry(format!(
            "tile size {tile_w}x{tile_h}"
        )));
    }

    let mut canvas = RgbaImage::from_pixel(tile_w, tile_h, Rgba([0, 0, 0, 0]));

    if let Some(base) = base {
        let inner_w = tile_w
            .checked_sub(margins.left + margins.right)
            .filter(|w| *w > 0)
            .ok_or_else(|| {
                DeckError::InvalidGeometry(format!(
                    "horizontal margins {}+{} exceed tile width {tile_w}",
                    margins.left, margins.right
                ))
            })?;
        let inner_h = tile_h
            .checked_sub(margins.top + margins.bottom)
            .filter(|h| *h > 0)
            .ok_or_else(|| {
                DeckError::InvalidGeometry(format!(
                    "vertical margins {}+{} exceed tile height {tile_h}",
                    margins.top, margins.bottom
                ))
            })?;

        let scaled = scale_to_fit(base, inner_w, inner_h)?;
        imageops::overlay(
            &mut canvas,
            &scaled,
            margins.left as i64,
            margins.top as i64,
        );
    }

    draw_labels(&mut canvas, labels, fonts, tile_w, tile_h);
    Ok(canvas)
}

/// Alpha-composite a foreground canvas over its background tile (or solid
/// black), producing the final RGB tile, optionally shrunk for press
/// feedback. Inputs are never mutated.
pub fn flatten_tile(
    foreground: Option<&RgbaImage>,
    background: Option<&RgbImage>,
    tile_size: (u32, u32),
    shrink: bool,
) -> RgbImage {
    let (tile_w, tile_h) = tile_size;
    let mut composed = match background {
        Some(bg) => DynamicImage::ImageRgb8(bg.clone()).to_rgba8(),
        None => RgbaImage::from_pixel(tile_w, tile_h, Rgba([0, 0, 0, 255])),
    };
    if let Some(fg) = foreground {
        imageops::overlay(&mut composed, fg, 0, 0);
    }
    let tile = DynamicImage::ImageRgba8(composed).to_rgb8();

    if shrink {
        shrink_tile(&tile)
    } else {
        tile
    }
}

/// Scale preserving aspect so the result fits within `max_w` x `max_h`.
fn scale_to_fit(image: &DynamicImage, max_w: u32, max_h: u32) -> Result<RgbaImage, DeckError> {
    let (w, h) = (image.width(), image.height());
    if w == 0 || h == 0 {
        return Err(DeckError::InvalidGeometry(format!("source image {w}x{h}")));
    }
    let ratio = (max_w as f64 / w as f64).min(max_h as f64 / h as f64);
    let new_w = ((w as f64 * ratio) as u32).max(1);
    let new_h = ((h as f64 * ratio) as u32).max(1);
    Ok(imageops::resize(
        &image.to_rgba8(),
        new_w,
        new_h,
        FilterType::Lanczos3,
    ))
}

/// Resample a tile down and recenter it on black, keeping the original size.
/// Press feedback only; stored tiles are never shrunk.
pub fn shrink_tile(tile: &RgbImage) -> RgbImage {
    let (w, h) = (tile.width(), tile.height());
    let shrink_w = (w * SHRINK_NUM / SHRINK_DEN).max(1);
    let shrink_h = (h * SHRINK_NUM / SHRINK_DEN).max(1);
    let small = imageops::resize(tile, shrink_w, shrink_h, FilterType::Lanczos3);

    let mut out = RgbImage::from_pixel(w, h, Rgb([0, 0, 0]));
    let x = ((w - shrink_w) / 2) as i64;
    let y = ((h - shrink_h) / 2) as i64;
    imageops::replace(&mut out, &small, x, y);
    out
}

/// Size of the virtual full-deck canvas for a layout, including the pixels
/// hidden behind the bezel between keys.
pub fn full_deck_size(layout: KeyLayout, key_size: (u32, u32), spacing: (u32, u32)) -> (u32, u32) {
    let cols = layout.cols as u32;
    let rows = layout.rows as u32;
    (
        key_size.0 * cols + spacing.0 * cols.saturating_sub(1),
        key_size.1 * rows + spacing.1 * rows.saturating_sub(1),
    )
}

/// Crop region `(x, y, w, h)` of one key within the full-deck canvas.
/// Keys are row-major: `row = key / cols`, `col = key % cols`.
pub fn key_crop_region(
    layout: KeyLayout,
    key_size: (u32, u32),
    spacing: (u32, u32),
    key: u8,
) -> (u32, u32, u32, u32) {
    let cols = layout.cols as u32;
    let row = key as u32 / cols;
    let col = key as u32 % cols;
    (
        col * (key_size.0 + spacing.0),
        row * (key_size.1 + spacing.1),
        key_size.0,
        key_size.1,
    )
}

/// Fit a source image onto the full-deck canvas (cover + center crop, never
/// letterbox) and slice it into one background tile per key, in index order.
pub fn slice_background(
    source: &DynamicImage,
    layout: KeyLayout,
    key_size: (u32, u32),
    spacing: (u32, u32),
) -> Result<Vec<RgbImage>, DeckError> {
    if layout.rows == 0 || layout.cols == 0 {
        return Err(DeckError::InvalidGeometry(format!(
            "deck layout {}x{}",
            layout.rows, layout.cols
        )));
    }
    if key_size.0 == 0 || key_size.1 == 0 {
        return Err(DeckError::InvalidGeometry(format!(
            "key size {}x{}",
            key_size.0, key_size.1
        )));
    }
    let key_count = layout.rows as u32 * layout.cols as u32;
    if key_count > u8::MAX as u32 {
        return Err(DeckError::InvalidGeometry(format!(
            "deck layout {}x{} exceeds addressable keys",
            layout.rows, layout.cols
        )));
    }

    let deck_size = full_deck_size(layout, key_size, spacing);
    let full = fit_and_crop(source, deck_size)?;

    let mut tiles = Vec::with_capacity(key_count as usize);
    for key in 0..key_count {
        let (x, y, w, h) = key_crop_region(layout, key_size, spacing, key as u8);
        tiles.push(imageops::crop_imm(&full, x, y, w, h).to_image());
    }
    Ok(tiles)
}

/// Scale preserving aspect so the image covers the target, then center-crop
/// the overflow.
fn fit_and_crop(source: &DynamicImage, target: (u32, u32)) -> Result<RgbImage, DeckError> {
    let (tw, th) = target;
    let (w, h) = (source.width(), source.height());
    if w == 0 || h == 0 || tw == 0 || th == 0 {
        return Err(DeckError::InvalidGeometry(format!(
            "fit {w}x{h} into {tw}x{th}"
        )));
    }

    let ratio = (tw as f64 / w as f64).max(th as f64 / h as f64);
    let scaled_w = ((w as f64 * ratio).ceil() as u32).max(tw);
    let scaled_h = ((h as f64 * ratio).ceil() as u32).max(th);

    let scaled = imageops::resize(&source.to_rgb8(), scaled_w, scaled_h, FilterType::Lanczos3);
    let x = (scaled_w - tw) / 2;
    let y = (scaled_h - th) / 2;
    Ok(imageops::crop_imm(&scaled, x, y, tw, th).to_image())
}

fn draw_labels(
    canvas: &mut RgbaImage,
    labels: &LabelSet,
    fonts: &FontStore,
    tile_w: u32,
    tile_h: u32,
) {
    // Middle-baseline anchoring; offsets keep glyphs clear of the bezel.
    if let Some(label) = &labels.top {
        draw_label(canvas, label, fonts, tile_w / 2, label.size - 3.0);
    }
    if let Some(label) = &labels.center {
        let baseline = (tile_h as f32 + label.size) / 2.0 - 3.0;
        draw_label(canvas, label, fonts, tile_w / 2, baseline);
    }
    if let Some(label) = &labels.bottom {
        draw_label(canvas, label, fonts, tile_w / 2, tile_h as f32 - 3.0);
    }
}

fn draw_label(
    canvas: &mut RgbaImage,
    label: &Label,
    fonts: &FontStore,
    center_x: u32,
    baseline_y: f32,
) {
    if label.text.is_empty() {
        return;
    }
    let Some(font) = fonts.resolve(label.font.as_deref()) else {
        tracing::warn!("No usable font for label {:?}, skipping", label.text);
        return;
    };

    let width = text_width(&font, &label.text, label.size);
    let x = center_x as f32 - width as f32 / 2.0;

    // Stroke first so the fill sits on top of it. Stroke shares the fill
    // color.
    let stroke = label.stroke_width as i32;
    if stroke > 0 {
        for dy in -stroke..=stroke {
            for dx in -stroke..=stroke {
                if dx * dx + dy * dy <= stroke * stroke && (dx != 0 || dy != 0) {
                    draw_text_baseline(
                        canvas,
                        &font,
                        &label.text,
                        x + dx as f32,
                        baseline_y + dy as f32,
                        label.size,
                        label.color,
                    );
                }
            }
        }
    }
    draw_text_baseline(
        canvas,
        &font,
        &label.text,
        x,
        baseline_y,
        label.size,
        label.color,
    );
}

/// Draw text with its baseline at `y`, alpha-blending onto the canvas.
fn draw_text_baseline(
    canvas: &mut RgbaImage,
    font: &Font,
    text: &str,
    x: f32,
    y: f32,
    size: f32,
    color: [u8; 4],
) {
    let scale = Scale::uniform(size);
    for glyph in font.layout(text, scale, point(x, y)) {
        if let Some(bb) = glyph.pixel_bounding_box() {
            glyph.draw(|gx, gy, v| {
                let px = bb.min.x + gx as i32;
                let py = bb.min.y + gy as i32;
                if px >= 0 && px < canvas.width() as i32 && py >= 0 && py < canvas.height() as i32 {
                    let alpha = (v * color[3] as f32) as u8;
                    canvas
                        .get_pixel_mut(px as u32, py as u32)
                        .blend(&Rgba([color[0], color[1], color[2], alpha]));
                }
            });
        }
    }
}

/// Rendered width of a line of text, in pixels.
fn text_width(font: &Font, text: &str, size: f32) -> i32 {
    let scale = Scale::uniform(size);
    let mut width = 0.0;
    for glyph in font.layout(text, scale, point(0.0, 0.0)) {
        if let Some(bb) = glyph.pixel_bounding_box() {
            width = bb.max.x as f32;
        } else {
            width += glyph.unpositioned().h_metrics().advance_width;
        }
    }
    width as i32
}
