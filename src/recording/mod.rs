//! Off-thread command recording.

pub mod encoder;
pub mod worker;

pub use encoder::CommandEncoder;
pub use worker::{RecordedJob, RecordingJob, RecordingWorker, WorkerState};
