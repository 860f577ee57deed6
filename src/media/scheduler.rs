//! Media task scheduler: the single writer in front of the device transport.
//!
//! All image and brightness writes funnel through one background task so
//! multi-packet writes never interleave on the shared connection. Pending
//! frames live in per-key latest-wins slots (capacity 1, overwrite on
//! enqueue): under producer bursts the device converges to the most recent
//! intended state instead of replaying a backlog.
//!
//! Animation drivers are spawned tasks guarded by a per-key generation
//! counter. Starting a new driver for a key bumps the generation; the old
//! driver notices at its next gen-checked submit and exits, so no stale frame
//! is enqueued after the new driver's first one.

use image::RgbaImage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::source::MediaSource;
use crate::device::{DeckTransport, NativeFrame, TransportError};
use crate::error::DeckError;

/// Consecutive transient write failures tolerated before escalating to a
/// disconnect.
const MAX_WRITE_RETRIES: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_millis(50);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Asynchronous conditions the controller subscribes to. Timer ticks have no
/// synchronous caller to return errors to, so they surface here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerEvent {
    DeviceDisconnected,
}

/// Pending-write state, all guarded by one mutex so generation checks and
/// slot stores are atomic with respect to each other.
struct State {
    /// Latest-wins frame slot per key.
    frames: Vec<Option<NativeFrame>>,
    /// Pending brightness change, also latest-wins.
    brightness: Option<u8>,
    /// Animation generation per key, plus one trailing slot for the
    /// background driver.
    gens: Vec<u64>,
    /// Keys with a live animation driver, mapped to that driver's generation.
    animations: HashMap<u8, u64>,
}

struct Shared<T: DeckTransport> {
    transport: Arc<T>,
    state: Mutex<State>,
    notify: Notify,
    background_playing: AtomicBool,
    halted: AtomicBool,
    events: mpsc::UnboundedSender<SchedulerEvent>,
    key_count: u8,
}

impl<T: DeckTransport> Shared<T> {
    fn halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Stop everything and surface exactly one disconnect notification.
    fn halt(&self) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            warn!("Scheduler halted: device disconnected");
            let _ = self.events.send(SchedulerEvent::DeviceDisconnected);
        }
        self.notify.notify_one();
    }

    /// Stop without emitting a disconnect event (graceful shutdown).
    fn halt_quietly(&self) {
        self.halted.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned pending-write table is unrecoverable for this session.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Background driver generation lives past the real key indices.
    fn background_slot(&self) -> u8 {
        self.key_count
    }

    fn store_frame(&self, key: u8, frame: NativeFrame) {
        self.lock().frames[key as usize] = Some(frame);
        self.notify.notify_one();
    }

    /// Store a frame only if the submitting driver still owns its slot.
    /// Returns false when the driver has been superseded.
    fn store_frame_if_current(&self, gen_slot: u8, gen: u64, key: u8, frame: NativeFrame) -> bool {
        {
            let mut state = self.lock();
            if state.gens[gen_slot as usize] != gen {
                return false;
            }
            state.frames[key as usize] = Some(frame);
        }
        self.notify.notify_one();
        true
    }

    /// Bump the generation for a slot, cancelling whatever driver owned it,
    /// and register the new owner.
    fn begin_animation(&self, gen_slot: u8) -> u64 {
        let mut state = self.lock();
        state.gens[gen_slot as usize] += 1;
        let gen = state.gens[gen_slot as usize];
        state.animations.insert(gen_slot, gen);
        gen
    }

    /// Driver cleanup on natural termination. A superseded driver leaves the
    /// bookkeeping to its successor.
    fn finish_animation(&self, gen_slot: u8, gen: u64) {
        let mut state = self.lock();
        if state.animations.get(&gen_slot) == Some(&gen) {
            state.animations.remove(&gen_slot);
            if gen_slot == self.background_slot() {
                self.background_playing.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Whether a driver still owns its slot. Drivers poll this every tick
    /// so cancellation lands even when no frame is ever stored.
    fn driver_current(&self, gen_slot: u8, gen: u64) -> bool {
        self.lock().gens[gen_slot as usize] == gen
    }

    fn cancel_animation(&self, gen_slot: u8) {
        let mut state = self.lock();
        state.gens[gen_slot as usize] += 1;
        state.animations.remove(&gen_slot);
        if gen_slot == self.background_slot() {
            self.background_playing.store(false, Ordering::SeqCst);
        }
    }
}

/// Owns the writer task and the animation drivers for one deck.
pub struct MediaScheduler<T: DeckTransport> {
    shared: Arc<Shared<T>>,
    writer: JoinHandle<()>,
}

impl<T: DeckTransport> MediaScheduler<T> {
    /// Spawn the writer task. The returned receiver carries asynchronous
    /// scheduler conditions (currently only disconnects).
    pub fn new(transport: Arc<T>) -> (Self, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let key_count = transport.key_count();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            transport,
            state: Mutex::new(State {
                frames: vec![None; key_count as usize],
                brightness: None,
                gens: vec![0; key_count as usize + 1],
                animations: HashMap::new(),
            }),
            notify: Notify::new(),
            background_playing: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            events: events_tx,
            key_count,
        });

        let writer = tokio::spawn(writer_loop(Arc::clone(&shared)));

        (Self { shared, writer }, events_rx)
    }

    fn check_key(&self, key: u8) -> Result<(), DeckError> {
        if key >= self.shared.key_count {
            return Err(DeckError::InvalidGeometry(format!(
                "key {key} out of range (deck has {} keys)",
                self.shared.key_count
            )));
        }
        Ok(())
    }

    fn check_running(&self) -> Result<(), DeckError> {
        if self.shared.halted() {
            return Err(DeckError::DeviceDisconnected);
        }
        Ok(())
    }

    /// One-shot "render and push" task for a key. Supersedes any frame still
    /// pending for the same key.
    pub fn submit_key_frame(&self, key: u8, frame: NativeFrame) -> Result<(), DeckError> {
        self.check_running()?;
        self.check_key(key)?;
        self.shared.store_frame(key, frame);
        Ok(())
    }

    /// Queue a brightness change through the single writer.
    pub fn set_brightness(&self, percent: u8) -> Result<(), DeckError> {
        self.check_running()?;
        self.shared.lock().brightness = Some(percent.min(100));
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Start an animation driver for one key. `producer` composes each raw
    /// frame into a native frame; it runs on the driver task, never on the
    /// caller. Replaces any running driver for the key.
    pub fn start_key_animation<P>(
        &self,
        key: u8,
        source: MediaSource,
        looping: bool,
        fps: f32,
        producer: P,
    ) -> Result<(), DeckError>
    where
        P: FnMut(&RgbaImage) -> Result<NativeFrame, DeckError> + Send + 'static,
    {
        self.check_running()?;
        self.check_key(key)?;

        if self.background_playing() {
            debug!("Background animation active, suppressing animation for key {key}");
            return Ok(());
        }

        let gen = self.shared.begin_animation(key);
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            drive_key_animation(shared, key, gen, source, looping, fps, producer).await;
        });
        Ok(())
    }

    /// Stop the animation driver for a key, if any. The key keeps showing
    /// its last frame.
    pub fn stop_key_animation(&self, key: u8) {
        if key < self.shared.key_count {
            self.shared.cancel_animation(key);
        }
    }

    /// Start the deck-wide background driver. `producer` turns each raw
    /// frame into per-key native frames. Cancels all per-key drivers first;
    /// while running, new per-key drivers are suppressed.
    pub fn start_background_animation<P>(
        &self,
        source: MediaSource,
        looping: bool,
        fps: f32,
        producer: P,
    ) -> Result<(), DeckError>
    where
        P: FnMut(&RgbaImage) -> Result<Vec<(u8, NativeFrame)>, DeckError> + Send + 'static,
    {
        self.check_running()?;

        for key in 0..self.shared.key_count {
            self.shared.cancel_animation(key);
        }

        let slot = self.shared.background_slot();
        let gen = self.shared.begin_animation(slot);
        self.shared.background_playing.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            drive_background_animation(shared, gen, source, looping, fps, producer).await;
        });
        Ok(())
    }

    pub fn stop_background_animation(&self) {
        self.shared.cancel_animation(self.shared.background_slot());
    }

    /// True while a background animation drives the deck. The controller
    /// suppresses shrink feedback for every key while this holds.
    pub fn background_playing(&self) -> bool {
        self.shared.background_playing.load(Ordering::SeqCst)
    }

    /// Whether an animation driver currently owns this key.
    pub fn has_animation(&self, key: u8) -> bool {
        self.shared.lock().animations.contains_key(&key)
    }

    pub fn halted(&self) -> bool {
        self.shared.halted()
    }

    /// Graceful stop: cancel drivers and the writer without reporting a
    /// disconnect.
    pub fn shutdown(&self) {
        info!("Stopping media scheduler");
        self.shared.halt_quietly();
        self.writer.abort();
    }
}

/// Drains latest-wins slots to the transport. The only caller of the
/// transport's write entry points.
async fn writer_loop<T: DeckTransport>(shared: Arc<Shared<T>>) {
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.tick().await; // first tick is immediate
    let mut retries: u32 = 0;

    loop {
        tokio::select! {
            _ = shared.notify.notified() => {}
            _ = keepalive.tick() => {
                if shared.halted() {
                    return;
                }
                if let Err(TransportError::Disconnected) = shared.transport.keep_alive().await {
                    shared.halt();
                    return;
                }
            }
        }

        loop {
            if shared.halted() {
                return;
            }

            let (brightness, batch) = {
                let mut state = shared.lock();
                let brightness = state.brightness.take();
                let mut batch = Vec::new();
                for (key, slot) in state.frames.iter_mut().enumerate() {
                    if let Some(frame) = slot.take() {
                        batch.push((key as u8, frame));
                    }
                }
                (brightness, batch)
            };

            if brightness.is_none() && batch.is_empty() {
                break;
            }

            if let Some(percent) = brightness {
                match shared.transport.set_brightness(percent).await {
                    Ok(()) => {}
                    Err(TransportError::Disconnected) => {
                        shared.halt();
                        return;
                    }
                    Err(TransportError::Transient(msg)) => {
                        warn!("Brightness write failed: {}", msg);
                    }
                }
            }

            for (key, frame) in batch {
                match shared.transport.set_key_image(key, &frame).await {
                    Ok(()) => {
                        retries = 0;
                    }
                    Err(TransportError::Disconnected) => {
                        shared.halt();
                        return;
                    }
                    Err(TransportError::Transient(msg)) => {
                        retries += 1;
                        warn!(
                            "Write to key {} failed ({}/{}): {}",
                            key, retries, MAX_WRITE_RETRIES, msg
                        );
                        if retries >= MAX_WRITE_RETRIES {
                            shared.halt();
                            return;
                        }
                        // Put the frame back unless something newer arrived.
                        {
                            let mut state = shared.lock();
                            let slot = &mut state.frames[key as usize];
                            if slot.is_none() {
                                *slot = Some(frame);
                            }
                        }
                        shared.notify.notify_one();
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }
    }
}

async fn drive_key_animation<T, P>(
    shared: Arc<Shared<T>>,
    key: u8,
    gen: u64,
    mut source: MediaSource,
    looping: bool,
    fps: f32,
    mut producer: P,
) where
    T: DeckTransport,
    P: FnMut(&RgbaImage) -> Result<NativeFrame, DeckError> + Send + 'static,
{
    let mut ticker = tokio::time::interval(frame_interval(fps));
    debug!("Animation driver for key {key} started (gen {gen})");

    loop {
        ticker.tick().await;
        if shared.halted() {
            break;
        }
        if !shared.driver_current(key, gen) {
            debug!("Animation driver for key {key} superseded (gen {gen})");
            return;
        }

        let Some(raw) = next_or_rewind(&mut source, looping) else {
            break;
        };
        let native = match producer(&raw) {
            Ok(native) => native,
            Err(e) => {
                warn!("Frame composition for key {key} failed: {e}");
                continue;
            }
        };
        if !shared.store_frame_if_current(key, gen, key, native) {
            // Superseded by a newer driver; successor owns the bookkeeping.
            debug!("Animation driver for key {key} superseded (gen {gen})");
            return;
        }
    }

    shared.finish_animation(key, gen);
    debug!("Animation driver for key {key} finished (gen {gen})");
}

async fn drive_background_animation<T, P>(
    shared: Arc<Shared<T>>,
    gen: u64,
    mut source: MediaSource,
    looping: bool,
    fps: f32,
    mut producer: P,
) where
    T: DeckTransport,
    P: FnMut(&RgbaImage) -> Result<Vec<(u8, NativeFrame)>, DeckError> + Send + 'static,
{
    let slot = shared.background_slot();
    let mut ticker = tokio::time::interval(frame_interval(fps));
    info!("Background animation driver started (gen {gen})");

    'outer: loop {
        ticker.tick().await;
        if shared.halted() {
            break;
        }
        if !shared.driver_current(slot, gen) {
            debug!("Background driver superseded (gen {gen})");
            return;
        }

        let Some(raw) = next_or_rewind(&mut source, looping) else {
            break;
        };
        let frames = match producer(&raw) {
            Ok(frames) => frames,
            Err(e) => {
                warn!("Background frame composition failed: {e}");
                continue;
            }
        };
        for (key, native) in frames {
            if key >= shared.key_count {
                continue;
            }
            if !shared.store_frame_if_current(slot, gen, key, native) {
                debug!("Background driver superseded (gen {gen})");
                break 'outer;
            }
        }
    }

    shared.finish_animation(slot, gen);
    info!("Background animation driver finished (gen {gen})");
}

fn next_or_rewind(source: &mut MediaSource, looping: bool) -> Option<Arc<RgbaImage>> {
    match source.next_frame() {
        Some(frame) => Some(frame),
        None if looping => {
            source.rewind();
            source.next_frame()
        }
        None => None,
    }
}

fn frame_interval(fps: f32) -> Duration {
    Duration::from_secs_f64(1.0 / f64::from(fps.max(0.1)))
}
