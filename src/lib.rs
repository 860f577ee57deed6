pub mod config;
pub mod deck;
pub mod device;
pub mod display;
pub mod error;
pub mod media;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use config::Config;
use deck::DeckController;
use device::{DeckTransport, HidTransport, TransportError};
use display::FontStore;
use error::DeckError;
use media::SchedulerEvent;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const POLL_IDLE_DELAY: Duration = Duration::from_millis(10);

/// One connected device: transport, controller, and the scheduler's
/// event channel. Torn down and rebuilt across reconnects.
struct Session {
    transport: Arc<HidTransport>,
    controller: DeckController<HidTransport>,
    events: mpsc::UnboundedReceiver<SchedulerEvent>,
}

/// Main application struct
pub struct App {
    config: Config,
    fonts: Arc<FontStore>,
    session: Option<Session>,
}

impl App {
    pub fn new(config: Config) -> Self {
        let fonts = Arc::new(FontStore::new(config.render.font.clone()));
        Self {
            config,
            fonts,
            session: None,
        }
    }

    /// Run until the device goes away for good or the caller cancels.
    /// Reconnects automatically after a disconnect.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            if self.session.is_none() {
                match self.connect().await {
                    Ok(session) => {
                        info!("Device ready");
                        self.session = Some(session);
                    }
                    Err(e) => {
                        warn!("Connect failed: {e}, retrying in {RECONNECT_DELAY:?}");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                }
            }
            if self.drive_session().await? {
                // Disconnected: drop the session and go back to connecting.
                self.teardown().await;
            }
        }
    }

    /// Connect, paint the initial state, apply configured defaults.
    async fn connect(&self) -> Result<Session> {
        let transport = Arc::new(HidTransport::connect().await?);
        transport.open().await?;
        transport.reset().await?;

        let hold_threshold = Duration::from_millis(self.config.device.hold_threshold_ms);
        let (controller, events) = DeckController::new(
            Arc::clone(&transport),
            Arc::clone(&self.fonts),
            hold_threshold,
        );

        controller.set_brightness(self.config.device.brightness)?;
        // Paint stored content first; an animated background driver then
        // owns every key's frames without racing static submissions.
        controller.reload_all_keys(false)?;
        if let Some(background) = &self.config.render.background {
            let render = &self.config.render;
            if let Err(e) =
                controller.set_background(background, render.background_loop, render.background_fps)
            {
                warn!("Background {} not applied: {e}", background.display());
            }
        }

        Ok(Session {
            transport,
            controller,
            events,
        })
    }

    /// Poll input and scheduler events for the current session. Returns
    /// true when the session should be torn down.
    async fn drive_session(&mut self) -> Result<bool> {
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return Ok(false),
        };

        if let Ok(SchedulerEvent::DeviceDisconnected) = session.events.try_recv() {
            warn!("Device disconnected, will try to reconnect...");
            return Ok(true);
        }

        match session.transport.poll_event().await {
            Ok(Some(input)) => match session.controller.handle_key_input(input) {
                Ok(()) => {}
                Err(DeckError::DeviceDisconnected) => return Ok(true),
                Err(e) => error!("Key handling failed: {e}"),
            },
            Ok(None) => tokio::time::sleep(POLL_IDLE_DELAY).await,
            Err(TransportError::Disconnected) => {
                warn!("Device disconnected, will try to reconnect...");
                return Ok(true);
            }
            Err(TransportError::Transient(e)) => {
                warn!("Input poll failed: {e}");
                tokio::time::sleep(POLL_IDLE_DELAY).await;
            }
        }
        Ok(false)
    }

    async fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            session.controller.reset_interaction_state();
            session.controller.shutdown();
            if let Err(e) = session.transport.close().await {
                warn!("Close failed: {e}");
            }
        }
    }

    /// Gracefully shutdown the application
    pub async fn shutdown(&mut self) {
        info!("Shutting down deckhand...");
        self.teardown().await;
        info!("Shutdown complete");
    }
}
