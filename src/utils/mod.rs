//! Utility helpers: the generational id allocator and frame-phase logging.

pub mod allocator;
pub mod logging;

pub use allocator::{Arena, ArenaId, ArenaKey};
pub use logging::{warn_if_frame_budget_exceeded, ScopedTimer};
