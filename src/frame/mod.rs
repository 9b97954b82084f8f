//! Frame-in-flight bookkeeping: the slot counter, per-slot resource rings and the
//! deferred removal queue.

pub mod counter;
pub mod removal;
pub mod ring;

pub use counter::{FrameCounter, FrameSlot};
pub use removal::RemovalQueue;
pub use ring::{FrameResourceRing, UniformRing};
