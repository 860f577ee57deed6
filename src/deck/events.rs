//! Key event classification and fan-out.
//!
//! Raw transport input is an edge (pressed or released). The controller
//! turns edges into the richer event stream subscribers actually want:
//! down, up, and a hold/short classification derived from press duration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;

/// What happened on a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEventKind {
    /// Key went down.
    Down,
    /// Key came back up. Always emitted before the classification event.
    Up,
    /// Key has been held past the hold threshold and is still down.
    HoldBegin,
    /// Key released after a hold. Follows a `HoldBegin`.
    HoldUp,
    /// Key released before the hold threshold.
    ShortUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: u8,
    pub kind: KeyEventKind,
}

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

/// Multi-subscriber key event dispatch. Subscribers that drop their
/// receiver are pruned on the next publish.
pub struct EventBus {
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<KeyEvent>>>,
    next_token: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> (SubscriptionToken, mpsc::UnboundedReceiver<KeyEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(token, tx);
        (SubscriptionToken(token), rx)
    }

    /// Returns false if the token was already gone.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.lock().remove(&token.0).is_some()
    }

    pub fn publish(&self, event: KeyEvent) {
        debug!("Key event: {:?}", event);
        self.lock().retain(|_, tx| tx.send(event).is_ok());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, mpsc::UnboundedSender<KeyEvent>>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-key press bookkeeping behind the hold/short classification.
///
/// Each press gets a sequence number so a delayed hold check can tell
/// whether the key is still down from the *same* press or was released
/// and pressed again in the meantime.
pub struct InteractionTracker {
    keys: Mutex<Vec<KeyInteraction>>,
    hold_threshold: Duration,
}

#[derive(Clone, Copy, Default)]
struct KeyInteraction {
    pressed: bool,
    pressed_at: Option<Instant>,
    press_seq: u64,
}

impl InteractionTracker {
    pub fn new(key_count: u8, hold_threshold: Duration) -> Self {
        Self {
            keys: Mutex::new(vec![KeyInteraction::default(); key_count as usize]),
            hold_threshold,
        }
    }

    pub fn hold_threshold(&self) -> Duration {
        self.hold_threshold
    }

    /// Record a press and return its sequence number.
    pub fn press(&self, key: u8) -> u64 {
        let mut keys = self.lock();
        let entry = &mut keys[key as usize];
        entry.pressed = true;
        entry.pressed_at = Some(Instant::now());
        entry.press_seq += 1;
        entry.press_seq
    }

    /// Record a release and return how long the key was down, if a press
    /// was tracked for it.
    pub fn release(&self, key: u8) -> Option<Duration> {
        let mut keys = self.lock();
        let entry = &mut keys[key as usize];
        entry.pressed = false;
        entry.pressed_at.take().map(|at| at.elapsed())
    }

    pub fn is_pressed(&self, key: u8) -> bool {
        self.lock()[key as usize].pressed
    }

    /// True if the key is still down from the press identified by `seq`.
    pub fn still_held(&self, key: u8, seq: u64) -> bool {
        let keys = self.lock();
        let entry = &keys[key as usize];
        entry.pressed && entry.press_seq == seq
    }

    /// Forget all in-flight presses. Used across reconnects so a press
    /// tracked on the old connection cannot classify on the new one.
    pub fn reset(&self) {
        let mut keys = self.lock();
        for entry in keys.iter_mut() {
            *entry = KeyInteraction::default();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<KeyInteraction>> {
        match self.keys.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_delivers_to_all_subscribers() {
        let bus = EventBus::new();
        let (_ta, mut rx_a) = bus.subscribe();
        let (_tb, mut rx_b) = bus.subscribe();

        bus.publish(KeyEvent {
            key: 3,
            kind: KeyEventKind::Down,
        });

        assert_eq!(rx_a.try_recv().unwrap().key, 3);
        assert_eq!(rx_b.try_recv().unwrap().kind, KeyEventKind::Down);
    }

    #[test]
    fn unsubscribed_receiver_gets_nothing() {
        let bus = EventBus::new();
        let (token, mut rx) = bus.subscribe();

        assert!(bus.unsubscribe(token));
        assert!(!bus.unsubscribe(token));

        bus.publish(KeyEvent {
            key: 0,
            kind: KeyEventKind::Up,
        });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_receiver_is_pruned_on_publish() {
        let bus = EventBus::new();
        let (_token, rx) = bus.subscribe();
        drop(rx);

        bus.publish(KeyEvent {
            key: 1,
            kind: KeyEventKind::Down,
        });
        assert!(bus.lock().is_empty());
    }

    #[test]
    fn press_sequence_distinguishes_presses() {
        let tracker = InteractionTracker::new(10, Duration::from_millis(500));

        let seq = tracker.press(2);
        assert!(tracker.is_pressed(2));
        assert!(tracker.still_held(2, seq));

        tracker.release(2);
        assert!(!tracker.still_held(2, seq));

        // A new press is a different interaction.
        let seq2 = tracker.press(2);
        assert_ne!(seq, seq2);
        assert!(!tracker.still_held(2, seq));
        assert!(tracker.still_held(2, seq2));
    }

    #[test]
    fn release_reports_press_duration() {
        let tracker = InteractionTracker::new(10, Duration::from_millis(500));

        tracker.press(0);
        std::thread::sleep(Duration::from_millis(20));
        let held = tracker.release(0).unwrap();
        assert!(held >= Duration::from_millis(20));

        // Release without a tracked press.
        assert!(tracker.release(0).is_none());
    }

    #[test]
    fn reset_clears_in_flight_presses() {
        let tracker = InteractionTracker::new(10, Duration::from_millis(500));
        let seq = tracker.press(5);

        tracker.reset();
        assert!(!tracker.is_pressed(5));
        assert!(!tracker.still_held(5, seq));
    }
}
