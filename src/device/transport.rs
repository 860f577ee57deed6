//! Capability-set abstraction over the physical deck.
//!
//! Everything above this layer talks to the device through [`DeckTransport`];
//! the concrete HID implementation lives in [`super::hid`]. Keeping the seam
//! here lets the scheduler and controller run against a recording mock in
//! tests.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Transport-level failures, split so the scheduler can classify them.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A single operation failed but the device is still attached.
    /// The scheduler retries the frame on its next pass.
    #[error("transient transport error: {0}")]
    Transient(String),

    /// The device is gone. Terminal for the current session.
    #[error("device disconnected")]
    Disconnected,
}

/// Physical key grid of a connected deck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyLayout {
    pub rows: u8,
    pub cols: u8,
}

/// Pixel encoding the device expects for key images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEncoding {
    Jpeg,
    Rgb,
    Bgr,
}

/// Orientation baked into the native frame before transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRotation {
    Rot0,
    Rot90,
    Rot180,
    Rot270,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMirror {
    None,
    Horizontal,
    Vertical,
}

/// Per-key image format from the device capability descriptor.
/// Immutable for the lifetime of a connected device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyImageFormat {
    /// Width and height of one key display in pixels.
    pub size: (u32, u32),
    pub encoding: FrameEncoding,
    pub rotation: FrameRotation,
    pub mirror: FrameMirror,
}

/// Device-encoding-ready pixel buffer for one key.
///
/// Bytes are shared so frames clone cheaply through the scheduler's slots.
#[derive(Debug, Clone)]
pub struct NativeFrame {
    pub bytes: Arc<[u8]>,
    pub size: (u32, u32),
}

impl PartialEq for NativeFrame {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size && self.bytes == other.bytes
    }
}

impl Eq for NativeFrame {}

/// Raw press/release event for one key, before hold classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyInput {
    pub key: u8,
    pub pressed: bool,
}

/// Capability set of a physical deck.
///
/// Write entry points (`set_key_image`, `set_brightness`, `keep_alive`) are
/// single-writer: only the media scheduler's writer task may call them once
/// the scheduler is running, so multi-packet image writes never interleave
/// on the shared connection.
#[async_trait]
pub trait DeckTransport: Send + Sync + 'static {
    fn key_count(&self) -> u8;

    fn key_layout(&self) -> KeyLayout;

    fn key_image_format(&self) -> KeyImageFormat;

    async fn open(&self) -> Result<(), TransportError>;

    async fn reset(&self) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    async fn set_key_image(&self, key: u8, frame: &NativeFrame) -> Result<(), TransportError>;

    async fn set_brightness(&self, percent: u8) -> Result<(), TransportError>;

    /// Periodic no-op write preventing device timeout. Optional.
    async fn keep_alive(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Poll for the next key event. Must not block longer than a few
    /// milliseconds so the caller's loop stays responsive.
    async fn poll_event(&self) -> Result<Option<KeyInput>, TransportError>;
}
