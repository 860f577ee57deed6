use thiserror::Error;

/// Errors surfaced by the compositor, codec, scheduler and controller.
#[derive(Debug, Error)]
pub enum DeckError {
    /// Source file or buffer could not be decoded. Callers fall back to a
    /// black tile; never fatal.
    #[error("failed to load image: {0}")]
    ImageLoad(String),

    /// A computed crop or resize region is degenerate.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// The device capability descriptor asks for an encoding the codec
    /// cannot produce.
    #[error("unsupported key image format: {0}")]
    UnsupportedFormat(String),

    /// The device is gone. Halts the scheduler until a new transport is
    /// attached.
    #[error("device disconnected")]
    DeviceDisconnected,
}

impl From<image::ImageError> for DeckError {
    fn from(err: image::ImageError) -> Self {
        DeckError::ImageLoad(err.to_string())
    }
}

impl From<std::io::Error> for DeckError {
    fn from(err: std::io::Error) -> Self {
        DeckError::ImageLoad(err.to_string())
    }
}
