//! Live progress fan-out.

pub mod observers;
pub mod tracker;

pub use observers::{Observer, ObserverId, ObserverSet, OBSERVER_QUEUE_CAPACITY};
pub use tracker::{resolve_view, ProgressTracker};
