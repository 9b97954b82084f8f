use frame_orchestrator::config::COMMAND_RING_SIZE;
use frame_orchestrator::gpu::{Command, GpuDevice, HeadlessDevice, ObjectKind};
use frame_orchestrator::recording::{RecordingJob, RecordingWorker, WorkerState};
use frame_orchestrator::{FrameScheduler, RenderError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn draws(count: u32) -> RecordingJob {
    Box::new(move |encoder| {
        for _ in 0..count {
            encoder.draw(3)?;
        }
        Ok(())
    })
}

#[test]
fn scheduler_and_workers_are_send() {
    fn assert_send<T: Send>() {}
    assert_send::<FrameScheduler>();
    assert_send::<RecordingWorker>();
}

#[test]
fn workers_record_concurrently() {
    let device = Arc::new(HeadlessDevice::new());
    let mut workers: Vec<RecordingWorker> = (0..8)
        .map(|i| RecordingWorker::new(device.clone(), format!("worker-{i}")).unwrap())
        .collect();

    let started = Arc::new(AtomicUsize::new(0));
    let mut buffers = Vec::new();
    for (i, worker) in workers.iter_mut().enumerate() {
        let started = started.clone();
        let job: RecordingJob = Box::new(move |encoder| {
            started.fetch_add(1, Ordering::SeqCst);
            for _ in 0..=i {
                encoder.draw(3)?;
            }
            Ok(())
        });
        buffers.push(worker.submit(job).unwrap());
    }

    for (i, worker) in workers.iter_mut().enumerate() {
        let recorded = worker.wait().unwrap();
        assert_eq!(recorded.command_buffer, buffers[i]);
        assert_eq!(recorded.draws as usize, i + 1);
        assert_eq!(worker.state(), WorkerState::Idle);
    }
    assert_eq!(started.load(Ordering::SeqCst), 8);
    assert!(buffers.iter().all(|cb| !device.is_recording(*cb)));
}

#[test]
fn ring_reuses_buffers_in_order() {
    let device = Arc::new(HeadlessDevice::new());
    let mut worker = RecordingWorker::new(device.clone(), "ring").unwrap();
    let mut seen = Vec::new();
    for frame in 0..(COMMAND_RING_SIZE * 2) {
        seen.push(worker.submit(draws(frame as u32)).unwrap());
        worker.wait().unwrap();
    }
    assert_eq!(seen[..COMMAND_RING_SIZE], seen[COMMAND_RING_SIZE..]);

    // Re-recording a buffer replaces its previous contents.
    let last = *seen.last().unwrap();
    let recorded = device
        .commands(last)
        .iter()
        .filter(|command| command.is_draw())
        .count();
    assert_eq!(recorded, COMMAND_RING_SIZE * 2 - 1);
}

#[test]
fn misuse_is_reported() {
    let device = Arc::new(HeadlessDevice::new());
    let mut worker = RecordingWorker::new(device, "misuse").unwrap();
    assert!(matches!(worker.wait(), Err(RenderError::WorkerIdle(_))));

    worker.submit(draws(1)).unwrap();
    assert!(matches!(
        worker.submit(draws(1)),
        Err(RenderError::WorkerBusy(_))
    ));
    worker.wait().unwrap();
}

#[test]
fn job_errors_surface_on_wait() {
    let device = Arc::new(HeadlessDevice::new());
    let mut worker = RecordingWorker::new(device.clone(), "failing").unwrap();
    let cb = worker
        .submit(Box::new(|encoder| {
            encoder.encode(Command::EndRenderPass)?;
            Err(RenderError::InvalidConfig("bad frame".into()))
        }))
        .unwrap();
    assert!(matches!(
        worker.wait(),
        Err(RenderError::InvalidConfig(_))
    ));
    assert!(!device.is_recording(cb));
    device.wait_idle().unwrap();

    // The worker stays usable afterwards.
    worker.submit(draws(2)).unwrap();
    assert_eq!(worker.wait().unwrap().draws, 2);
}

#[test]
fn dropping_workers_frees_their_pools() {
    let device = Arc::new(HeadlessDevice::new());
    {
        let _a = RecordingWorker::new(device.clone(), "a").unwrap();
        let mut b = RecordingWorker::new(device.clone(), "b").unwrap();
        b.submit(draws(1)).unwrap();
        assert_eq!(device.live_objects(ObjectKind::CommandPool), 2);
    }
    assert_eq!(device.live_objects(ObjectKind::CommandPool), 0);
}
