mod hid;
mod protocol;
#[cfg(test)]
pub mod testing;
mod transport;

pub use hid::{DeviceInfo, HidTransport};
pub use protocol::*;
pub use transport::{
    DeckTransport, FrameEncoding, FrameMirror, FrameRotation, KeyImageFormat, KeyInput, KeyLayout,
    NativeFrame, TransportError,
};
