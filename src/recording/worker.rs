//! Persistent recording thread with its own command pool.
//!
//! A worker owns a ring of [`COMMAND_RING_SIZE`] command buffers and records exactly one
//! job at a time:
//!
//! ```text
//! Idle --submit--> Recording --wait--> Idle
//! ```
//!
//! The ring rotates on every `submit`, so the buffer recorded this frame is never the
//! one submitted to the GPU last frame.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::encoder::CommandEncoder;
use crate::config::COMMAND_RING_SIZE;
use crate::gpu::{CommandBufferHandle, CommandPoolHandle, GpuDevice};
use crate::{RenderError, Result};

/// Work handed to a worker. Captures everything it needs by value.
pub type RecordingJob = Box<dyn FnOnce(&mut CommandEncoder) -> Result<()> + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Recording,
}

/// Result of a joined job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedJob {
    pub command_buffer: CommandBufferHandle,
    pub draws: u32,
}

struct WorkItem {
    command_buffer: CommandBufferHandle,
    job: RecordingJob,
}

pub struct RecordingWorker {
    name: String,
    device: Arc<dyn GpuDevice>,
    pool: CommandPoolHandle,
    command_buffers: Vec<CommandBufferHandle>,
    next: usize,
    state: WorkerState,
    jobs: Option<Sender<WorkItem>>,
    done: Receiver<Result<RecordedJob>>,
    thread: Option<JoinHandle<()>>,
}

impl RecordingWorker {
    pub fn new(device: Arc<dyn GpuDevice>, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let pool = device.create_command_pool()?;
        let command_buffers = match device.allocate_command_buffers(pool, COMMAND_RING_SIZE as u32)
        {
            Ok(buffers) => buffers,
            Err(err) => {
                device.destroy_command_pool(pool);
                return Err(err);
            }
        };

        let (job_tx, job_rx) = unbounded::<WorkItem>();
        let (done_tx, done_rx) = bounded::<Result<RecordedJob>>(1);
        let thread_device = device.clone();
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(thread_device, job_rx, done_tx));
        let thread = match thread {
            Ok(thread) => thread,
            Err(err) => {
                device.destroy_command_pool(pool);
                log::error!("[RecordingWorker] Failed to spawn '{name}': {err}");
                return Err(RenderError::WorkerLost(format!("spawn '{name}': {err}")));
            }
        };
        log::debug!("[RecordingWorker] '{name}' started");

        Ok(Self {
            name,
            device,
            pool,
            command_buffers,
            next: 0,
            state: WorkerState::Idle,
            jobs: Some(job_tx),
            done: done_rx,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn command_buffers(&self) -> &[CommandBufferHandle] {
        &self.command_buffers
    }

    /// Hands `job` to the worker thread and returns the command buffer it records into.
    ///
    /// Only valid while idle; a busy worker rejects the job without touching its ring.
    pub fn submit(&mut self, job: RecordingJob) -> Result<CommandBufferHandle> {
        if self.state == WorkerState::Recording {
            log::error!("[RecordingWorker] '{}' got a job while recording", self.name);
            return Err(RenderError::WorkerBusy(self.name.clone()));
        }
        let sender = self
            .jobs
            .as_ref()
            .ok_or_else(|| RenderError::WorkerLost(self.name.clone()))?;

        let command_buffer = self.command_buffers[self.next];
        sender
            .send(WorkItem {
                command_buffer,
                job,
            })
            .map_err(|_| RenderError::WorkerLost(self.name.clone()))?;
        self.next = (self.next + 1) % self.command_buffers.len();
        self.state = WorkerState::Recording;
        log::trace!("[RecordingWorker] '{}' recording into {command_buffer:?}", self.name);
        Ok(command_buffer)
    }

    /// Blocks until the submitted job finished. Rejected when no job is pending.
    pub fn wait(&mut self) -> Result<RecordedJob> {
        if self.state == WorkerState::Idle {
            return Err(RenderError::WorkerIdle(self.name.clone()));
        }
        let outcome = self.done.recv();
        self.state = WorkerState::Idle;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                log::error!("[RecordingWorker] '{}' exited mid-job", self.name);
                Err(RenderError::WorkerLost(self.name.clone()))
            }
        }
    }
}

fn run(device: Arc<dyn GpuDevice>, jobs: Receiver<WorkItem>, done: Sender<Result<RecordedJob>>) {
    while let Ok(item) = jobs.recv() {
        let result = record(&device, item);
        if done.send(result).is_err() {
            break;
        }
    }
}

fn record(device: &Arc<dyn GpuDevice>, item: WorkItem) -> Result<RecordedJob> {
    let WorkItem {
        command_buffer,
        job,
    } = item;
    device.begin_command_buffer(command_buffer)?;
    let mut encoder = CommandEncoder::new(device.clone(), command_buffer);
    let recorded = job(&mut encoder);
    // The buffer is closed even when the job failed so the pool stays resettable.
    let ended = device.end_command_buffer(command_buffer);
    recorded?;
    ended?;
    Ok(RecordedJob {
        command_buffer,
        draws: encoder.draw_count(),
    })
}

impl Drop for RecordingWorker {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("[RecordingWorker] '{}' panicked", self.name);
            }
        }
        self.device.destroy_command_pool(self.pool);
        log::debug!("[RecordingWorker] '{}' stopped", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{Command, HeadlessDevice, ObjectKind};

    fn draw_job(count: u32) -> RecordingJob {
        Box::new(move |encoder| {
            for _ in 0..count {
                encoder.draw(3)?;
            }
            Ok(())
        })
    }

    #[test]
    fn submit_wait_cycle() {
        let device = Arc::new(HeadlessDevice::new());
        let mut worker = RecordingWorker::new(device.clone(), "test").unwrap();
        let cb = worker.submit(draw_job(2)).unwrap();
        assert_eq!(worker.state(), WorkerState::Recording);

        let recorded = worker.wait().unwrap();
        assert_eq!(recorded.command_buffer, cb);
        assert_eq!(recorded.draws, 2);
        assert_eq!(worker.state(), WorkerState::Idle);
        assert!(!device.is_recording(cb));
        assert_eq!(device.commands(cb).len(), 2);
    }

    #[test]
    fn ring_rotates_on_submit() {
        let device = Arc::new(HeadlessDevice::new());
        let mut worker = RecordingWorker::new(device.clone(), "ring").unwrap();
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(worker.submit(draw_job(0)).unwrap());
            worker.wait().unwrap();
        }
        assert_ne!(seen[0], seen[1]);
        assert_eq!(seen[0], seen[2]);
        assert_eq!(seen[1], seen[3]);
    }

    #[test]
    fn busy_and_idle_are_rejected() {
        let device = Arc::new(HeadlessDevice::new());
        let mut worker = RecordingWorker::new(device.clone(), "strict").unwrap();
        assert!(matches!(worker.wait(), Err(RenderError::WorkerIdle(_))));

        let first = worker.submit(draw_job(1)).unwrap();
        assert!(matches!(
            worker.submit(draw_job(1)),
            Err(RenderError::WorkerBusy(_))
        ));
        assert_eq!(worker.wait().unwrap().command_buffer, first);
        assert!(matches!(worker.wait(), Err(RenderError::WorkerIdle(_))));
    }

    #[test]
    fn failed_job_still_ends_buffer() {
        let device = Arc::new(HeadlessDevice::new());
        let mut worker = RecordingWorker::new(device.clone(), "failing").unwrap();
        let cb = worker
            .submit(Box::new(|encoder| {
                encoder.encode(Command::EndRenderPass)?;
                Err(RenderError::ResourceNotFound("mesh".to_string()))
            }))
            .unwrap();
        assert!(matches!(
            worker.wait(),
            Err(RenderError::ResourceNotFound(_))
        ));
        assert!(!device.is_recording(cb));
        assert!(device.wait_idle().is_ok());
    }

    #[test]
    fn drop_releases_pool() {
        let device = Arc::new(HeadlessDevice::new());
        {
            let mut worker = RecordingWorker::new(device.clone(), "scoped").unwrap();
            worker.submit(draw_job(1)).unwrap();
            assert_eq!(
                device.live_objects(ObjectKind::CommandBuffer),
                COMMAND_RING_SIZE
            );
        }
        assert_eq!(device.live_objects(ObjectKind::CommandPool), 0);
        assert_eq!(device.live_objects(ObjectKind::CommandBuffer), 0);
    }
}
