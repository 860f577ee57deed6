//! Deck controller: per-key visual state and the event entry point.
//!
//! The controller owns what each key *should* show (base media, labels,
//! margins, background participation) and turns that into encoded frames for
//! the scheduler. Stored tiles are replaced, never mutated in place, so
//! press feedback and animation frames can composite from a stable snapshot.

use image::{DynamicImage, RgbImage, RgbaImage};
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::device::{DeckTransport, KeyImageFormat, KeyInput, KeyLayout};
use crate::display::{
    compose_foreground, encode_native, flatten_tile, slice_background, FontStore, LabelSet,
    Margins, DEFAULT_KEY_SPACING,
};
use crate::error::DeckError;
use crate::media::{MediaScheduler, MediaSource, SchedulerEvent};

use super::events::{EventBus, InteractionTracker, KeyEvent, KeyEventKind, SubscriptionToken};

/// Where a key's base image comes from.
pub enum ImageSource {
    Path(std::path::PathBuf),
    Image(DynamicImage),
    None,
}

/// Everything needed to re-render one key.
#[derive(Clone)]
struct KeyVisual {
    base: Option<Arc<DynamicImage>>,
    foreground: Option<Arc<RgbaImage>>,
    labels: LabelSet,
    margins: Margins,
    with_background: bool,
}

impl Default for KeyVisual {
    fn default() -> Self {
        Self {
            base: None,
            foreground: None,
            labels: LabelSet::default(),
            margins: Margins::default(),
            with_background: true,
        }
    }
}

/// Shared visual state, also read by animation driver closures.
struct ControllerState {
    tiles: RwLock<Vec<KeyVisual>>,
    background: RwLock<Vec<Option<Arc<RgbImage>>>>,
}

impl ControllerState {
    fn tiles(&self) -> RwLockReadGuard<'_, Vec<KeyVisual>> {
        match self.tiles.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn tiles_mut(&self) -> RwLockWriteGuard<'_, Vec<KeyVisual>> {
        match self.tiles.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn background(&self) -> RwLockReadGuard<'_, Vec<Option<Arc<RgbImage>>>> {
        match self.background.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn background_mut(&self) -> RwLockWriteGuard<'_, Vec<Option<Arc<RgbImage>>>> {
        match self.background.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Flatten one key's stored visuals into an encoded native frame.
fn render_key(
    state: &ControllerState,
    key: u8,
    format: &KeyImageFormat,
    shrink: bool,
) -> Result<crate::device::NativeFrame, DeckError> {
    let tiles = state.tiles();
    let visual = &tiles[key as usize];
    let background = state.background();
    let bg = if visual.with_background {
        background[key as usize].as_deref()
    } else {
        None
    };
    let tile = flatten_tile(visual.foreground.as_deref(), bg, format.size, shrink);
    encode_native(&tile, format)
}

pub struct DeckController<T: DeckTransport> {
    scheduler: MediaScheduler<T>,
    state: Arc<ControllerState>,
    fonts: Arc<FontStore>,
    tracker: Arc<InteractionTracker>,
    bus: Arc<EventBus>,
    format: KeyImageFormat,
    layout: KeyLayout,
    key_count: u8,
    spacing: (u32, u32),
}

impl<T: DeckTransport> DeckController<T> {
    pub fn new(
        transport: Arc<T>,
        fonts: Arc<FontStore>,
        hold_threshold: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let key_count = transport.key_count();
        let format = transport.key_image_format();
        let layout = transport.key_layout();
        let (scheduler, events) = MediaScheduler::new(transport);

        let controller = Self {
            scheduler,
            state: Arc::new(ControllerState {
                tiles: RwLock::new(vec![KeyVisual::default(); key_count as usize]),
                background: RwLock::new(vec![None; key_count as usize]),
            }),
            fonts,
            tracker: Arc::new(InteractionTracker::new(key_count, hold_threshold)),
            bus: Arc::new(EventBus::new()),
            format,
            layout,
            key_count,
            spacing: DEFAULT_KEY_SPACING,
        };
        (controller, events)
    }

    pub fn key_count(&self) -> u8 {
        self.key_count
    }

    fn check_key(&self, key: u8) -> Result<(), DeckError> {
        if key >= self.key_count {
            return Err(DeckError::InvalidGeometry(format!(
                "key {key} out of range (deck has {} keys)",
                self.key_count
            )));
        }
        Ok(())
    }

    /// Set a key's static content. At least one of a base image or a label
    /// must be given. Replaces any running animation on the key.
    pub fn set_image(
        &self,
        key: u8,
        source: ImageSource,
        labels: LabelSet,
        margins: Margins,
        with_background: bool,
    ) -> Result<(), DeckError> {
        self.check_key(key)?;

        let base = match source {
            ImageSource::Path(path) => {
                let image = image::open(&path)
                    .map_err(|e| DeckError::ImageLoad(format!("{}: {e}", path.display())))?;
                Some(Arc::new(image))
            }
            ImageSource::Image(image) => Some(Arc::new(image)),
            ImageSource::None => {
                if labels.is_empty() {
                    return Err(DeckError::ImageLoad(
                        "nothing to draw: no media and no labels".to_string(),
                    ));
                }
                None
            }
        };

        let foreground = Arc::new(compose_foreground(
            base.as_deref(),
            &labels,
            &self.fonts,
            margins,
            self.format.size,
        )?);

        self.scheduler.stop_key_animation(key);
        {
            let mut tiles = self.state.tiles_mut();
            tiles[key as usize] = KeyVisual {
                base,
                foreground: Some(foreground),
                labels,
                margins,
                with_background,
            };
        }
        self.repaint_key(key)
    }

    /// Replace a key's labels and re-render over the stored base image.
    pub fn set_labels(&self, key: u8, labels: LabelSet) -> Result<(), DeckError> {
        self.check_key(key)?;

        let (base, margins) = {
            let tiles = self.state.tiles();
            let visual = &tiles[key as usize];
            (visual.base.clone(), visual.margins)
        };
        let foreground = Arc::new(compose_foreground(
            base.as_deref(),
            &labels,
            &self.fonts,
            margins,
            self.format.size,
        )?);
        {
            let mut tiles = self.state.tiles_mut();
            let visual = &mut tiles[key as usize];
            visual.foreground = Some(foreground);
            visual.labels = labels;
        }

        // A running driver picks the new labels up on its next frame.
        if self.scheduler.has_animation(key) {
            return Ok(());
        }
        self.repaint_key(key)
    }

    /// Play an animated source on one key. Labels and margins stored for the
    /// key are composited onto every frame.
    pub fn set_video(
        &self,
        key: u8,
        path: &Path,
        looping: bool,
        fps: f32,
    ) -> Result<(), DeckError> {
        self.check_key(key)?;
        let source = MediaSource::open(path)?;

        let state = Arc::clone(&self.state);
        let fonts = Arc::clone(&self.fonts);
        let tracker = Arc::clone(&self.tracker);
        let format = self.format;
        self.scheduler
            .start_key_animation(key, source, looping, fps, move |raw| {
                let (labels, margins, with_background) = {
                    let tiles = state.tiles();
                    let visual = &tiles[key as usize];
                    (visual.labels.clone(), visual.margins, visual.with_background)
                };
                let base = DynamicImage::ImageRgba8(raw.clone());
                let foreground = compose_foreground(
                    Some(&base),
                    &labels,
                    &fonts,
                    margins,
                    format.size,
                )?;
                let background = state.background();
                let bg = if with_background {
                    background[key as usize].as_deref()
                } else {
                    None
                };
                let tile = flatten_tile(
                    Some(&foreground),
                    bg,
                    format.size,
                    tracker.is_pressed(key),
                );
                encode_native(&tile, &format)
            })
    }

    /// Stop a key's animation, leaving the last frame on the device.
    pub fn stop_video(&self, key: u8) {
        self.scheduler.stop_key_animation(key);
    }

    /// Set the deck-wide background. A static image is sliced into per-key
    /// tiles and every key re-rendered; an animated source additionally
    /// starts the background driver.
    pub fn set_background(
        &self,
        path: &Path,
        looping: bool,
        fps: f32,
    ) -> Result<(), DeckError> {
        let mut source = MediaSource::open(path)?;
        let first = source
            .next_frame()
            .ok_or_else(|| DeckError::ImageLoad(format!("{}: no frames", path.display())))?;

        let deck_image = DynamicImage::ImageRgba8((*first).clone());
        let slices = slice_background(&deck_image, self.layout, self.format.size, self.spacing)?;
        {
            let mut background = self.state.background_mut();
            for (slot, slice) in background.iter_mut().zip(slices) {
                *slot = Some(Arc::new(slice));
            }
        }

        if !source.is_animated() {
            self.scheduler.stop_background_animation();
            return self.reload_all_keys(true);
        }

        source.rewind();
        let state = Arc::clone(&self.state);
        let format = self.format;
        let layout = self.layout;
        let spacing = self.spacing;
        let key_count = self.key_count;
        self.scheduler
            .start_background_animation(source, looping, fps, move |raw| {
                let deck_image = DynamicImage::ImageRgba8(raw.clone());
                let slices = slice_background(&deck_image, layout, format.size, spacing)?;
                let tiles = state.tiles();
                let mut frames = Vec::with_capacity(key_count as usize);
                for (key, slice) in slices.into_iter().enumerate().take(key_count as usize) {
                    let visual = &tiles[key];
                    if !visual.with_background {
                        continue;
                    }
                    let tile =
                        flatten_tile(visual.foreground.as_deref(), Some(&slice), format.size, false);
                    frames.push((key as u8, encode_native(&tile, &format)?));
                }
                Ok(frames)
            })
    }

    /// Remove the background and re-render every non-animated key.
    pub fn clear_background(&self) -> Result<(), DeckError> {
        self.scheduler.stop_background_animation();
        {
            let mut background = self.state.background_mut();
            for slot in background.iter_mut() {
                *slot = None;
            }
        }
        self.reload_all_keys(true)
    }

    /// Re-render and submit every key from stored state. With
    /// `skip_animated`, keys with a live driver (and all keys while a
    /// background animation plays) keep their driver-produced frames.
    pub fn reload_all_keys(&self, skip_animated: bool) -> Result<(), DeckError> {
        for key in 0..self.key_count {
            if skip_animated
                && (self.scheduler.has_animation(key) || self.scheduler.background_playing())
            {
                continue;
            }
            let shrink = self.tracker.is_pressed(key);
            let frame = render_key(&self.state, key, &self.format, shrink)?;
            self.scheduler.submit_key_frame(key, frame)?;
        }
        Ok(())
    }

    pub fn set_brightness(&self, percent: u8) -> Result<(), DeckError> {
        self.scheduler.set_brightness(percent)
    }

    /// Entry point for raw transport input. Classifies the edge, publishes
    /// events, and submits press/release feedback frames.
    pub fn handle_key_input(&self, input: KeyInput) -> Result<(), DeckError> {
        if input.key >= self.key_count {
            debug!("Ignoring input for out-of-range key {}", input.key);
            return Ok(());
        }
        let key = input.key;

        if input.pressed {
            let seq = self.tracker.press(key);
            self.bus.publish(KeyEvent {
                key,
                kind: KeyEventKind::Down,
            });

            // Fire HoldBegin from a timer so it lands while the key is
            // still down, not at release time.
            let tracker = Arc::clone(&self.tracker);
            let bus = Arc::clone(&self.bus);
            let threshold = self.tracker.hold_threshold();
            tokio::spawn(async move {
                tokio::time::sleep(threshold).await;
                if tracker.still_held(key, seq) {
                    bus.publish(KeyEvent {
                        key,
                        kind: KeyEventKind::HoldBegin,
                    });
                }
            });

            self.submit_feedback(key, true)?;
        } else {
            let held = self.tracker.release(key);
            self.bus.publish(KeyEvent {
                key,
                kind: KeyEventKind::Up,
            });
            let kind = match held {
                Some(duration) if duration >= self.tracker.hold_threshold() => {
                    KeyEventKind::HoldUp
                }
                _ => KeyEventKind::ShortUp,
            };
            self.bus.publish(KeyEvent { key, kind });

            self.submit_feedback(key, false)?;
        }
        Ok(())
    }

    /// Press/release feedback frame. Suppressed while a background animation
    /// plays; animated keys get their shrink through the driver instead.
    fn submit_feedback(&self, key: u8, shrink: bool) -> Result<(), DeckError> {
        if self.scheduler.background_playing() || self.scheduler.has_animation(key) {
            return Ok(());
        }
        let frame = render_key(&self.state, key, &self.format, shrink)?;
        self.scheduler.submit_key_frame(key, frame)
    }

    /// Static re-render of one key, skipped while drivers own its frames.
    fn repaint_key(&self, key: u8) -> Result<(), DeckError> {
        if self.scheduler.background_playing() {
            return Ok(());
        }
        let shrink = self.tracker.is_pressed(key);
        let frame = render_key(&self.state, key, &self.format, shrink)?;
        self.scheduler.submit_key_frame(key, frame)
    }

    pub fn subscribe(&self) -> (SubscriptionToken, mpsc::UnboundedReceiver<KeyEvent>) {
        self.bus.subscribe()
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.bus.unsubscribe(token)
    }

    /// Drop in-flight press tracking, e.g. across a reconnect.
    pub fn reset_interaction_state(&self) {
        self.tracker.reset();
    }

    pub fn scheduler_halted(&self) -> bool {
        self.scheduler.halted()
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use tokio::time::sleep;

    use crate::device::testing::RecordingTransport;
    use crate::media::MediaSource;

    fn white_key_image(size: (u32, u32)) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(size.0, size.1, Rgb([255, 255, 255])))
    }

    fn controller(
        transport: Arc<RecordingTransport>,
        hold_threshold: Duration,
    ) -> DeckController<RecordingTransport> {
        let fonts = Arc::new(FontStore::new(None));
        let (controller, _events) = DeckController::new(transport, fonts, hold_threshold);
        controller
    }

    /// Raw RGB pixel from a RecordingTransport frame (72x72, Rgb encoding).
    fn pixel(frame: &crate::device::NativeFrame, x: u32, y: u32) -> [u8; 3] {
        let idx = ((y * frame.size.0 + x) * 3) as usize;
        [frame.bytes[idx], frame.bytes[idx + 1], frame.bytes[idx + 2]]
    }

    #[tokio::test]
    async fn press_submits_shrunk_composite() {
        let transport = Arc::new(RecordingTransport::new());
        let deck = controller(Arc::clone(&transport), Duration::from_millis(500));

        deck.set_image(
            2,
            ImageSource::Image(white_key_image((72, 72))),
            LabelSet::default(),
            Margins::default(),
            true,
        )
        .unwrap();
        deck.handle_key_input(KeyInput {
            key: 2,
            pressed: true,
        })
        .unwrap();
        sleep(Duration::from_millis(100)).await;

        let writes = transport.recorded();
        let last = &writes.last().unwrap().1;
        // Shrunk frame: black border, white recentered content.
        assert_eq!(pixel(last, 0, 0), [0, 0, 0]);
        assert_eq!(pixel(last, 36, 36), [255, 255, 255]);

        deck.handle_key_input(KeyInput {
            key: 2,
            pressed: false,
        })
        .unwrap();
        sleep(Duration::from_millis(100)).await;
        let writes = transport.recorded();
        let last = &writes.last().unwrap().1;
        assert_eq!(pixel(last, 0, 0), [255, 255, 255]);
        deck.shutdown();
    }

    #[tokio::test]
    async fn hold_and_short_press_classification() {
        let transport = Arc::new(RecordingTransport::new());
        let deck = controller(transport, Duration::from_millis(50));
        let (_token, mut events) = deck.subscribe();

        // Short press: released well before the threshold.
        deck.handle_key_input(KeyInput {
            key: 0,
            pressed: true,
        })
        .unwrap();
        deck.handle_key_input(KeyInput {
            key: 0,
            pressed: false,
        })
        .unwrap();
        sleep(Duration::from_millis(120)).await;

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind);
        }
        assert_eq!(
            kinds,
            vec![KeyEventKind::Down, KeyEventKind::Up, KeyEventKind::ShortUp]
        );

        // Hold: released after the threshold, HoldBegin fires mid-press.
        deck.handle_key_input(KeyInput {
            key: 0,
            pressed: true,
        })
        .unwrap();
        sleep(Duration::from_millis(120)).await;
        deck.handle_key_input(KeyInput {
            key: 0,
            pressed: false,
        })
        .unwrap();
        sleep(Duration::from_millis(50)).await;

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind);
        }
        assert_eq!(
            kinds,
            vec![
                KeyEventKind::Down,
                KeyEventKind::HoldBegin,
                KeyEventKind::Up,
                KeyEventKind::HoldUp
            ]
        );
        deck.shutdown();
    }

    #[tokio::test]
    async fn background_animation_suppresses_press_feedback() {
        let transport = Arc::new(RecordingTransport::new());
        let deck = controller(Arc::clone(&transport), Duration::from_millis(500));
        let (_token, mut events) = deck.subscribe();

        // Silent background driver: occupies the background slot without
        // producing frames, so write counts stay deterministic.
        let source = MediaSource::from_frames(vec![Arc::new(RgbaImage::from_pixel(
            1,
            1,
            image::Rgba([0, 0, 0, 255]),
        ))]);
        deck.scheduler
            .start_background_animation(source, true, 10.0, |_| Ok(Vec::new()))
            .unwrap();
        sleep(Duration::from_millis(50)).await;

        let before = transport.recorded().len();
        deck.handle_key_input(KeyInput {
            key: 4,
            pressed: true,
        })
        .unwrap();
        sleep(Duration::from_millis(50)).await;

        // No feedback frame, but events still flow.
        assert_eq!(transport.recorded().len(), before);
        assert_eq!(events.try_recv().unwrap().kind, KeyEventKind::Down);
        deck.shutdown();
    }

    #[tokio::test]
    async fn set_image_requires_media_or_labels() {
        let transport = Arc::new(RecordingTransport::new());
        let deck = controller(transport, Duration::from_millis(500));

        let result = deck.set_image(
            0,
            ImageSource::None,
            LabelSet::default(),
            Margins::default(),
            true,
        );
        assert!(matches!(result, Err(DeckError::ImageLoad(_))));

        let result = deck.set_image(
            0,
            ImageSource::Path("/nonexistent/key.png".into()),
            LabelSet::default(),
            Margins::default(),
            true,
        );
        assert!(matches!(result, Err(DeckError::ImageLoad(_))));
        deck.shutdown();
    }

    #[tokio::test]
    async fn reload_skips_animated_keys() {
        let transport = Arc::new(RecordingTransport::new());
        let deck = controller(Arc::clone(&transport), Duration::from_millis(500));

        let source = MediaSource::from_frames(vec![Arc::new(RgbaImage::from_pixel(
            72,
            72,
            image::Rgba([0, 255, 0, 255]),
        ))]);
        deck.scheduler
            .start_key_animation(3, source, true, 5.0, {
                let format = deck.format;
                move |raw| {
                    let tile = DynamicImage::ImageRgba8(raw.clone()).to_rgb8();
                    encode_native(&tile, &format)
                }
            })
            .unwrap();
        sleep(Duration::from_millis(50)).await;

        let before_key3 = transport.tags_for_key(3).len();
        deck.reload_all_keys(true).unwrap();
        sleep(Duration::from_millis(100)).await;

        // Every static key repainted once; key 3 untouched by the reload.
        for key in 0..10u8 {
            if key == 3 {
                continue;
            }
            assert!(!transport.tags_for_key(key).is_empty(), "key {key} skipped");
        }
        let after_key3 = transport.tags_for_key(3).len();
        assert!(after_key3 <= before_key3 + 1);
        deck.shutdown();
    }

    #[tokio::test]
    async fn reload_writes_nothing_while_background_plays() {
        let transport = Arc::new(RecordingTransport::new());
        let deck = controller(Arc::clone(&transport), Duration::from_millis(500));

        let source = MediaSource::from_frames(vec![Arc::new(RgbaImage::from_pixel(
            1,
            1,
            image::Rgba([0, 0, 0, 255]),
        ))]);
        deck.scheduler
            .start_background_animation(source, true, 10.0, |_| Ok(Vec::new()))
            .unwrap();

        let before = transport.recorded().len();
        deck.reload_all_keys(true).unwrap();
        sleep(Duration::from_millis(50)).await;

        assert_eq!(transport.recorded().len(), before);
        deck.shutdown();
    }

    #[tokio::test]
    async fn static_background_slices_and_repaints() {
        let transport = Arc::new(RecordingTransport::new());
        let deck = controller(Arc::clone(&transport), Duration::from_millis(500));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("background.png");
        // Solid red source; every key tile becomes pure red after
        // fit-and-crop, so any slice pixel checks out.
        let red = DynamicImage::ImageRgb8(RgbImage::from_pixel(600, 400, Rgb([200, 0, 0])));
        red.save(&path).unwrap();

        deck.set_background(&path, true, 30.0).unwrap();
        sleep(Duration::from_millis(100)).await;

        assert!(!deck.scheduler.background_playing());
        assert!(deck.state.background()[0].is_some());
        let writes = transport.recorded();
        let frame = &writes.last().unwrap().1;
        assert_eq!(pixel(frame, 36, 36), [200, 0, 0]);
        deck.shutdown();
    }

    #[tokio::test]
    async fn unsubscribe_revokes_delivery() {
        let transport = Arc::new(RecordingTransport::new());
        let deck = controller(transport, Duration::from_millis(500));

        let (token, mut events) = deck.subscribe();
        assert!(deck.unsubscribe(token));

        deck.handle_key_input(KeyInput {
            key: 1,
            pressed: true,
        })
        .unwrap();
        assert!(events.try_recv().is_err());
        deck.shutdown();
    }
}
