//! AKP05E/N4 device constants
//!
//! Display index mapping (for set_key_image):
//!   - Top row (5 keys):    display keys 10-14
//!   - Bottom row (5 keys): display keys 5-9
//!
//! Input mapping (key presses):
//!   - Top row:    IDs 1-5  (0x01-0x05) → logical keys 0-4
//!   - Bottom row: IDs 6-10 (0x06-0x0a) → logical keys 5-9

/// Key display dimensions (the N4 uses 112x112 square LCD keys)
pub const KEY_WIDTH: u32 = 112;
pub const KEY_HEIGHT: u32 = 112;

/// Physical key grid
pub const KEY_ROWS: u8 = 2;
pub const KEY_COLS: u8 = 5;

/// Number of addressable keys
pub const KEY_COUNT: u8 = 10;

/// Number of rotary encoders on the device (unused, needed for connect)
pub const ENCODER_COUNT: u8 = 4;

/// USB Vendor ID for AJAZZ/Mirabox (HOTSPOTEKUSB)
pub const VENDOR_ID: u16 = 0x0300;

/// USB Product ID for AKP05E/N4
pub const PRODUCT_ID: u16 = 0x3004;

/// Convert logical key ID (0-9) to device display key
///
/// The N4 display mapping is:
/// - Top row (keys 0-4) → display keys 10-14
/// - Bottom row (keys 5-9) → display keys 5-9
#[inline]
pub fn key_to_display_key(key: u8) -> u8 {
    if key < 5 {
        key + 10 // 0-4 → 10-14 (top row)
    } else {
        key // 5-9 → 5-9 (bottom row)
    }
}
