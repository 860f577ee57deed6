mod scheduler;
mod source;

pub use scheduler::{MediaScheduler, SchedulerEvent};
pub use source::MediaSource;
