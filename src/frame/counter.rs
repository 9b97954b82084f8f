use crate::config::FRAMES_IN_FLIGHT;

/// Index into a [`FrameResourceRing`](super::FrameResourceRing), always in `[0, FRAMES_IN_FLIGHT)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameSlot(usize);

impl FrameSlot {
    pub fn new(index: usize) -> Option<Self> {
        (index < FRAMES_IN_FLIGHT).then_some(Self(index))
    }

    pub fn index(self) -> usize {
        self.0
    }

    pub fn all() -> impl Iterator<Item = FrameSlot> {
        (0..FRAMES_IN_FLIGHT).map(FrameSlot)
    }
}

/// Counts logical frames and derives the ring slot for each.
///
/// Starts one step behind slot 0 so the first `advance` yields slot 0.
#[derive(Debug, Clone)]
pub struct FrameCounter {
    frame: u64,
    slot: usize,
}

impl Default for FrameCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCounter {
    pub fn new() -> Self {
        Self {
            frame: 0,
            slot: FRAMES_IN_FLIGHT - 1,
        }
    }

    /// Moves to the next slot. Call exactly once per logical frame.
    pub fn advance(&mut self) -> FrameSlot {
        self.frame += 1;
        self.slot = (self.slot + 1) % FRAMES_IN_FLIGHT;
        FrameSlot(self.slot)
    }

    pub fn current(&self) -> FrameSlot {
        FrameSlot(self.slot)
    }

    /// Number of advances so far.
    pub fn frame(&self) -> u64 {
        self.frame
    }
}
