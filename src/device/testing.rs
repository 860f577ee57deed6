//! Recording transport for scheduler and controller tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::transport::{
    DeckTransport, FrameEncoding, FrameMirror, FrameRotation, KeyImageFormat, KeyInput, KeyLayout,
    NativeFrame, TransportError,
};

/// In-memory transport: records every write, optionally blocks behind a
/// gate or injects failures at a chosen write attempt.
pub struct RecordingTransport {
    pub writes: Mutex<Vec<(u8, NativeFrame)>>,
    pub brightness: Mutex<Vec<u8>>,
    /// Held by a test to stall the writer inside a transport write.
    pub gate: Option<Arc<tokio::sync::Mutex<()>>>,
    /// Fail the nth write attempt (0-based) with a disconnect.
    pub disconnect_at: Option<usize>,
    /// Fail the nth write attempt (0-based) with a transient error, once.
    pub transient_at: Option<usize>,
    /// Fail every write attempt with a transient error.
    pub transient_always: bool,
    pub format: KeyImageFormat,
    write_attempts: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            writes: Mutex::new(Vec::new()),
            brightness: Mutex::new(Vec::new()),
            gate: None,
            disconnect_at: None,
            transient_at: None,
            transient_always: false,
            format: KeyImageFormat {
                size: (72, 72),
                encoding: FrameEncoding::Rgb,
                rotation: FrameRotation::Rot0,
                mirror: FrameMirror::None,
            },
            write_attempts: AtomicUsize::new(0),
        }
    }

    pub fn recorded(&self) -> Vec<(u8, NativeFrame)> {
        self.writes.lock().unwrap().clone()
    }

    /// Native frame payload tags written to one key, in order.
    pub fn tags_for_key(&self, key: u8) -> Vec<u8> {
        self.recorded()
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, f)| f.bytes[0])
            .collect()
    }
}

#[async_trait]
impl DeckTransport for RecordingTransport {
    fn key_count(&self) -> u8 {
        10
    }

    fn key_layout(&self) -> KeyLayout {
        KeyLayout { rows: 2, cols: 5 }
    }

    fn key_image_format(&self) -> KeyImageFormat {
        self.format
    }

    async fn open(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn reset(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn set_key_image(&self, key: u8, frame: &NativeFrame) -> Result<(), TransportError> {
        if let Some(gate) = &self.gate {
            let _hold = gate.lock().await;
        }
        let attempt = self.write_attempts.fetch_add(1, Ordering::SeqCst);
        if self.disconnect_at == Some(attempt) {
            return Err(TransportError::Disconnected);
        }
        if self.transient_always || self.transient_at == Some(attempt) {
            return Err(TransportError::Transient("flaky wire".to_string()));
        }
        self.writes.lock().unwrap().push((key, frame.clone()));
        Ok(())
    }

    async fn set_brightness(&self, percent: u8) -> Result<(), TransportError> {
        self.brightness.lock().unwrap().push(percent);
        Ok(())
    }

    async fn poll_event(&self) -> Result<Option<KeyInput>, TransportError> {
        Ok(None)
    }
}
