//! Shared helpers for the reader integration tests.
//!
//! Every queue built here uses a mock driver, a zero settle delay and a
//! generous poll timeout, so tests control timing by inserting cards and
//! cancelling tokens rather than by sleeping.

#![allow(dead_code)]

use cardgate_core::{JobId, ReadResult};
use cardgate_hardware::CardDriver;
use cardgate_hardware::mock::{MockDriver, MockDriverHandle, MockOperation};
use cardgate_reader::{JobQueue, QueueConfig};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const UID: [u8; 4] = [0x04, 0xAB, 0xCD, 0xEF];
pub const UID_HEX: &str = "04ABCDEF";

/// Upper bound for anything a test waits on.
pub const PATIENCE: Duration = Duration::from_secs(5);

pub fn quick_config() -> QueueConfig {
    QueueConfig::default()
        .with_timeout(Duration::from_secs(10))
        .with_settle_delay(Duration::ZERO)
}

pub fn mock_queue(config: QueueConfig) -> (JobQueue<MockDriver>, MockDriverHandle) {
    let (driver, handle) = MockDriver::new();
    let queue = JobQueue::new(driver, config).unwrap();
    (queue, handle)
}

/// Collects finished jobs in completion order.
pub struct Recorder {
    tx: Sender<(JobId, ReadResult)>,
    rx: Receiver<(JobId, ReadResult)>,
}

impl Recorder {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self { tx, rx }
    }

    /// Submit `id` so that its result lands in this recorder.
    pub fn submit<D: CardDriver + 'static>(&self, queue: &JobQueue<D>, id: u32, cancel: &CancellationToken) {
        let tx = self.tx.clone();
        let id = JobId::new(id);
        queue
            .submit(
                id,
                |_| {},
                move |result| {
                    let _ = tx.send((id, result));
                },
                cancel.clone(),
            )
            .unwrap();
    }

    pub fn next(&self) -> (JobId, ReadResult) {
        self.rx
            .recv_timeout(PATIENCE)
            .expect("job did not finish in time")
    }

    pub fn take(&self, count: usize) -> Vec<(JobId, ReadResult)> {
        (0..count).map(|_| self.next()).collect()
    }

    /// A result that has already arrived, without waiting.
    pub fn try_next(&self) -> Option<(JobId, ReadResult)> {
        self.rx.try_recv().ok()
    }

    /// Whether another result arrives within `wait`.
    pub fn has_more(&self, wait: Duration) -> bool {
        self.rx.recv_timeout(wait).is_ok()
    }
}

/// Wait until the worker (or another reader) is polling the mock reader.
pub fn wait_for_polls(handle: &MockDriverHandle, count: usize) {
    assert!(
        handle.wait_for_calls(MockOperation::GetStatusChange, count, PATIENCE),
        "reader was never polled"
    );
}
