mod controller;
mod events;

pub use controller::{DeckController, ImageSource};
pub use events::{EventBus, InteractionTracker, KeyEvent, KeyEventKind, SubscriptionToken};
