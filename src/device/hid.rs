//! HID transport for the AJAZZ AKP05E / Mirabox N4, built on mirajazz.

use async_trait::async_trait;
use image::DynamicImage;
use mirajazz::{
    device::{list_devices, Device},
    types::{DeviceInput, ImageFormat, ImageMirroring, ImageMode, ImageRotation},
};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::protocol::*;
use super::transport::{
    DeckTransport, FrameEncoding, FrameMirror, FrameRotation, KeyImageFormat, KeyInput, KeyLayout,
    NativeFrame, TransportError,
};

/// Device information
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub serial_number: String,
}

/// Previous key states for edge detection
struct InputState {
    keys: Vec<bool>,
}

/// Transport over the AKP05E's HID connection.
pub struct HidTransport {
    device: Device,
    input_state: Mutex<InputState>,
}

fn map_error(err: mirajazz::error::MirajazzError) -> TransportError {
    // mirajazz does not expose a structured disconnect variant we can rely
    // on across backends, so classify by message like the HID layer does.
    let text = err.to_string();
    if text.contains("Disconnected") || text.contains("disconnected") {
        TransportError::Disconnected
    } else {
        TransportError::Transient(text)
    }
}

impl HidTransport {
    /// Find and return device info without connecting
    pub async fn find_device() -> Result<DeviceInfo, TransportError> {
        let devices = list_devices(&[VENDOR_ID]).await.map_err(map_error)?;

        for (vid, pid, serial) in devices {
            if vid == VENDOR_ID && pid == PRODUCT_ID {
                return Ok(DeviceInfo {
                    name: "AJAZZ AKP05E".to_string(),
                    serial_number: serial,
                });
            }
        }

        Err(TransportError::Transient(
            "no compatible device found".to_string(),
        ))
    }

    /// Connect to the first compatible device
    pub async fn connect() -> Result<Self, TransportError> {
        info!("Connecting to device...");

        let devices = list_devices(&[VENDOR_ID]).await.map_err(map_error)?;

        let serial = devices
            .iter()
            .find(|(vid, pid, _)| *vid == VENDOR_ID && *pid == PRODUCT_ID)
            .map(|(_, _, s)| s.clone())
            .ok_or_else(|| TransportError::Transient("no compatible device found".to_string()))?;

        info!("Found device with serial: {}", serial);

        // N4/AKP05E: v2 protocol (1024-byte packets), supports both states
        let device = Device::connect(
            VENDOR_ID,
            PRODUCT_ID,
            serial,
            true,
            true,
            KEY_COUNT as usize,
            ENCODER_COUNT as usize,
        )
        .await
        .map_err(map_error)?;

        info!("Connected to device");

        Ok(Self {
            device,
            input_state: Mutex::new(InputState {
                keys: vec![false; KEY_COUNT as usize],
            }),
        })
    }

    /// Input processing function for mirajazz
    ///
    /// Key presses arrive as event IDs 0x01-0x0a with data[10] as the state
    /// byte. Encoder and strip events exist on this hardware but are not part
    /// of the key surface, so they map to NoData.
    fn process_input(
        event_type: u8,
        state: u8,
    ) -> Result<DeviceInput, mirajazz::error::MirajazzError> {
        match event_type {
            0x01..=0x0a => {
                let mut keys = vec![false; KEY_COUNT as usize];
                let key_idx = (event_type - 1) as usize;
                if key_idx < keys.len() {
                    keys[key_idx] = state != 0;
                }
                debug!(
                    "Key {} {}",
                    key_idx,
                    if state != 0 { "pressed" } else { "released" }
                );
                Ok(DeviceInput::ButtonStateChange(keys))
            }

            // Null/empty events (noise or padding)
            0x00 => Ok(DeviceInput::NoData),

            _ => {
                debug!(
                    "Ignoring HID event: type=0x{:02x}, state=0x{:02x}",
                    event_type, state
                );
                Ok(DeviceInput::NoData)
            }
        }
    }
}

#[async_trait]
impl DeckTransport for HidTransport {
    fn key_count(&self) -> u8 {
        KEY_COUNT
    }

    fn key_layout(&self) -> KeyLayout {
        KeyLayout {
            rows: KEY_ROWS,
            cols: KEY_COLS,
        }
    }

    fn key_image_format(&self) -> KeyImageFormat {
        KeyImageFormat {
            size: (KEY_WIDTH, KEY_HEIGHT),
            encoding: FrameEncoding::Jpeg,
            rotation: FrameRotation::Rot180,
            mirror: FrameMirror::None,
        }
    }

    async fn open(&self) -> Result<(), TransportError> {
        // Connection is established in connect(); wake the panel up.
        self.device.keep_alive().await.map_err(map_error)
    }

    async fn reset(&self) -> Result<(), TransportError> {
        debug!("Resetting device");
        self.device.reset().await.map_err(map_error)
    }

    async fn close(&self) -> Result<(), TransportError> {
        info!("Releasing HID connection");
        Ok(())
    }

    async fn set_key_image(&self, key: u8, frame: &NativeFrame) -> Result<(), TransportError> {
        if key >= KEY_COUNT {
            return Err(TransportError::Transient(format!(
                "invalid key index: {key}"
            )));
        }

        // The codec already baked orientation into the JPEG payload, so hand
        // mirajazz an identity format and the decoded pixels.
        let decoded = image::load_from_memory(&frame.bytes)
            .map_err(|e| TransportError::Transient(format!("bad native frame: {e}")))?;
        let dynamic_image = DynamicImage::ImageRgb8(decoded.to_rgb8());

        let format = ImageFormat {
            mode: ImageMode::JPEG,
            size: (frame.size.0 as usize, frame.size.1 as usize),
            rotation: ImageRotation::Rot0,
            mirror: ImageMirroring::None,
        };

        self.device
            .set_button_image(key_to_display_key(key), format, dynamic_image)
            .await
            .map_err(map_error)?;
        self.device.flush().await.map_err(map_error)
    }

    async fn set_brightness(&self, percent: u8) -> Result<(), TransportError> {
        let percent = percent.min(100);
        debug!("Setting brightness to {}%", percent);
        self.device.set_brightness(percent).await.map_err(map_error)
    }

    async fn keep_alive(&self) -> Result<(), TransportError> {
        self.device.keep_alive().await.map_err(map_error)
    }

    /// Poll for input events (non-blocking, 1ms timeout so the caller's
    /// loop stays responsive)
    async fn poll_event(&self) -> Result<Option<KeyInput>, TransportError> {
        let timeout = Duration::from_millis(1);

        match self
            .device
            .read_input(Some(timeout), Self::process_input)
            .await
        {
            Ok(DeviceInput::ButtonStateChange(states)) => {
                let mut input_state = self
                    .input_state
                    .lock()
                    .map_err(|_| TransportError::Transient("input state poisoned".to_string()))?;

                // Detect press/release edges
                for (i, &pressed) in states.iter().enumerate() {
                    if i < input_state.keys.len() {
                        let was_pressed = input_state.keys[i];
                        input_state.keys[i] = pressed;

                        if pressed != was_pressed {
                            return Ok(Some(KeyInput {
                                key: i as u8,
                                pressed,
                            }));
                        }
                    }
                }
                Ok(None)
            }
            Ok(_) => Ok(None),
            Err(e) => match map_error(e) {
                TransportError::Disconnected => {
                    warn!("Device disconnected");
                    Err(TransportError::Disconnected)
                }
                TransportError::Transient(msg) => {
                    warn!("Error reading device input: {}", msg);
                    Ok(None)
                }
            },
        }
    }
}
