//! Transfer instrumentation: byte counting and progress cadence.

pub mod counting;
pub mod progress;

pub use counting::ByteCounter;
pub use progress::{ProgressMeter, RateSample};
