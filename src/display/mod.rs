mod codec;
mod compositor;
mod fonts;

pub use codec::encode_native;
pub use compositor::{
    compose_foreground, compose_key_tile, flatten_tile, full_deck_size, key_crop_region,
    shrink_tile, slice_background, Label, LabelSet, Margins, DEFAULT_KEY_SPACING,
};
pub use fonts::FontStore;
