//! Integration tests for JobQueue
//!
//! These tests drive the worker thread end to end against the mock reader:
//! ordering, cancellation, back-pressure and shutdown.

mod common;

use cardgate_core::{Error, JobId};
use cardgate_hardware::mock::{MockCard, MockContext, MockDriver, MockOperation};
use cardgate_hardware::{CardDriver, DriverError, Protocols, ReaderState};
use cardgate_reader::JobQueue;
use common::{PATIENCE, Recorder, UID, UID_HEX, mock_queue, quick_config, wait_for_polls};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

#[test]
fn test_jobs_finish_in_submission_order() {
    let (queue, handle) = mock_queue(quick_config());
    handle.insert_card(&UID);
    let recorder = Recorder::new();

    for id in 0..5 {
        recorder.submit(&queue, id, &CancellationToken::new());
    }

    let finished = recorder.take(5);
    let ids: Vec<u32> = finished.iter().map(|(id, _)| id.as_u32()).collect();
    assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    assert!(finished.iter().all(|(_, r)| r.success && r.identifier == UID_HEX));
}

#[test]
fn test_cancelled_jobs_still_report_in_order() {
    let (queue, handle) = mock_queue(quick_config());
    let recorder = Recorder::new();
    let tokens: Vec<CancellationToken> = (0..5).map(|_| CancellationToken::new()).collect();

    for (id, token) in tokens.iter().enumerate() {
        recorder.submit(&queue, id as u32, token);
    }

    // Job 0 is polling an empty reader; job 2 is still queued.
    wait_for_polls(&handle, 2);
    tokens[0].cancel();
    tokens[2].cancel();

    let (id, first) = recorder.next();
    assert_eq!(id, JobId::new(0));
    assert!(!first.success);
    assert!(first.identifier.is_empty());
    assert_eq!(first.error, "card read cancelled");

    handle.insert_card(&UID);

    let rest = recorder.take(4);
    let ids: Vec<u32> = rest.iter().map(|(id, _)| id.as_u32()).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);

    for (id, result) in rest {
        if id == JobId::new(2) {
            assert_eq!(result.error, "card read cancelled");
            assert!(result.identifier.is_empty());
        } else {
            assert!(result.success, "job {} failed: {}", id, result.error);
            assert_eq!(result.identifier, UID_HEX);
        }
    }
}

#[test]
fn test_cancel_for_user_targets_running_job() {
    let (queue, handle) = mock_queue(quick_config());
    let recorder = Recorder::new();
    recorder.submit(&queue, 9, &CancellationToken::new());

    wait_for_polls(&handle, 2);
    assert_eq!(queue.session().active_user(), Some(JobId::new(9)));
    assert!(!queue.session().cancel_for_user(JobId::new(1)));
    assert!(queue.session().cancel_for_user(JobId::new(9)));

    let (id, result) = recorder.next();
    assert_eq!(id, JobId::new(9));
    assert_eq!(result.error, "card read cancelled");
}

#[test]
fn test_job_times_out_without_card() {
    let config = quick_config().with_timeout(Duration::from_millis(50));
    let (queue, _handle) = mock_queue(config);
    let recorder = Recorder::new();

    let started = Instant::now();
    recorder.submit(&queue, 1, &CancellationToken::new());
    let (_, result) = recorder.next();

    assert!(!result.success);
    assert!(result.identifier.is_empty());
    assert_eq!(result.error, Error::timeout(50).to_string());
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_direct_read_during_job_reports_contention() {
    let (queue, handle) = mock_queue(quick_config());
    let recorder = Recorder::new();
    let token = CancellationToken::new();
    recorder.submit(&queue, 1, &token);

    wait_for_polls(&handle, 2);
    let direct = queue.session().read(JobId::new(2), false, None);
    assert!(!direct.success);
    assert_eq!(direct.error, "failed to acquire mutex");

    token.cancel();
    let (_, queued) = recorder.next();
    assert_eq!(queued.error, "card read cancelled");
}

#[test]
fn test_full_queue_rejects_without_callbacks() {
    let config = quick_config()
        .with_capacity(1)
        .with_enqueue_wait(Duration::from_millis(10));
    let (queue, handle) = mock_queue(config);
    let finished = Arc::new(AtomicUsize::new(0));

    let submit = |id: u32| {
        let finished = Arc::clone(&finished);
        queue.submit(
            JobId::new(id),
            |_| {},
            move |_| {
                finished.fetch_add(1, Ordering::SeqCst);
            },
            CancellationToken::new(),
        )
    };

    // Job 0 occupies the worker, job 1 fills the only slot.
    submit(0).unwrap();
    wait_for_polls(&handle, 1);
    submit(1).unwrap();

    let started = Instant::now();
    let error = submit(2).unwrap_err();
    assert_eq!(
        error,
        Error::QueueFull {
            job_id: JobId::new(2),
            waited_ms: 10
        }
    );
    assert!(started.elapsed() >= Duration::from_millis(10));
    assert_eq!(queue.len(), 1);

    // Job 0 finishes cancelled, job 1 is discarded, job 2 never existed.
    queue.shutdown();
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}

#[test]
fn test_driver_failure_does_not_stop_worker() {
    let (queue, handle) = mock_queue(quick_config());
    handle.insert_card(&UID);
    handle.fail_next(
        MockOperation::Transmit,
        DriverError::communication("card removed mid-exchange"),
    );
    let recorder = Recorder::new();

    recorder.submit(&queue, 0, &CancellationToken::new());
    recorder.submit(&queue, 1, &CancellationToken::new());

    let (_, failed) = recorder.next();
    assert!(!failed.success);
    assert!(failed.error.contains("transmit"));

    let (_, retried) = recorder.next();
    assert!(retried.success);
    assert_eq!(handle.open_cards(), 0);
}

#[test]
fn test_panicking_callback_does_not_kill_worker() {
    let (queue, handle) = mock_queue(quick_config());
    handle.insert_card(&UID);

    queue
        .submit(
            JobId::new(0),
            |_| panic!("callback exploded"),
            |_| {},
            CancellationToken::new(),
        )
        .unwrap();

    let recorder = Recorder::new();
    recorder.submit(&queue, 1, &CancellationToken::new());

    let (id, result) = recorder.next();
    assert_eq!(id, JobId::new(1));
    assert!(result.success);
    assert!(queue.is_running());
}

#[test]
fn test_shutdown_is_prompt_and_idempotent() {
    let config = quick_config().with_settle_delay(Duration::from_secs(30));
    let (queue, _handle) = mock_queue(config);
    assert!(queue.is_running());

    let started = Instant::now();
    queue.shutdown();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!queue.is_running());

    queue.shutdown();
    assert!(!queue.is_running());
}

#[test]
fn test_shutdown_interrupts_settle_delay() {
    let config = quick_config().with_settle_delay(Duration::from_secs(30));
    let (queue, handle) = mock_queue(config);
    handle.insert_card(&UID);
    let recorder = Recorder::new();

    recorder.submit(&queue, 0, &CancellationToken::new());
    assert!(recorder.next().1.success);

    let started = Instant::now();
    queue.shutdown();
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_shutdown_cancels_running_read() {
    let (queue, handle) = mock_queue(quick_config());
    let recorder = Recorder::new();
    recorder.submit(&queue, 0, &CancellationToken::new());
    recorder.submit(&queue, 1, &CancellationToken::new());

    wait_for_polls(&handle, 2);
    queue.shutdown();

    let (id, result) = recorder.next();
    assert_eq!(id, JobId::new(0));
    assert_eq!(result.error, "card read cancelled");
    assert!(!recorder.has_more(Duration::from_millis(100)));
}

#[test]
fn test_concurrent_shutdowns_both_wait_for_worker() {
    let (queue, handle) = mock_queue(quick_config());
    handle.set_poll_latency(Duration::from_millis(300));
    let queue = Arc::new(queue);
    let recorder = Recorder::new();
    recorder.submit(&queue, 0, &CancellationToken::new());
    wait_for_polls(&handle, 1);

    let first = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || queue.shutdown())
    };
    thread::sleep(Duration::from_millis(20));
    queue.shutdown();

    // The in-flight poll is still running when the second call starts.
    assert!(!queue.is_running());
    let (id, result) = recorder.try_next().expect("job finished before shutdown returned");
    assert_eq!(id, JobId::new(0));
    assert_eq!(result.error, "card read cancelled");
    first.join().unwrap();
}

/// Mock driver whose first transmit panics while the session lock is held.
struct PanickyDriver {
    inner: MockDriver,
    armed: Arc<AtomicBool>,
}

impl CardDriver for PanickyDriver {
    type Context = MockContext;
    type Card = MockCard;

    fn establish_context(&mut self) -> cardgate_hardware::Result<MockContext> {
        self.inner.establish_context()
    }

    fn list_readers(&mut self, context: &MockContext) -> cardgate_hardware::Result<Vec<String>> {
        self.inner.list_readers(context)
    }

    fn get_status_change(
        &mut self,
        context: &MockContext,
        timeout: Duration,
        state: &mut ReaderState,
    ) -> cardgate_hardware::Result<()> {
        self.inner.get_status_change(context, timeout, state)
    }

    fn connect(
        &mut self,
        context: &MockContext,
        reader: &str,
        protocols: Protocols,
    ) -> cardgate_hardware::Result<MockCard> {
        self.inner.connect(context, reader, protocols)
    }

    fn transmit(&mut self, card: &MockCard, command: &[u8]) -> cardgate_hardware::Result<Vec<u8>> {
        if self.armed.swap(false, Ordering::SeqCst) {
            panic!("reader driver fault");
        }
        self.inner.transmit(card, command)
    }

    fn disconnect(&mut self, card: MockCard) -> cardgate_hardware::Result<()> {
        self.inner.disconnect(card)
    }

    fn release_context(&mut self, context: MockContext) -> cardgate_hardware::Result<()> {
        self.inner.release_context(context)
    }
}

#[test]
fn test_driver_panic_leaves_session_usable() {
    let (inner, handle) = MockDriver::new();
    handle.insert_card(&UID);
    let driver = PanickyDriver {
        inner,
        armed: Arc::new(AtomicBool::new(true)),
    };
    let queue = JobQueue::new(driver, quick_config()).unwrap();
    let recorder = Recorder::new();

    recorder.submit(&queue, 0, &CancellationToken::new());
    recorder.submit(&queue, 1, &CancellationToken::new());

    // Job 0 panicked mid-exchange and never reports.
    let (id, result) = recorder.next();
    assert_eq!(id, JobId::new(1));
    assert_eq!(result.identifier, UID_HEX);
    assert!(result.success);

    // The card handle left open by the panic was closed by the next read.
    assert_eq!(handle.open_cards(), 0);
    assert_eq!(handle.calls(MockOperation::Connect), 2);
    assert_eq!(queue.session().active_user(), None);
    assert!(queue.is_running());
}

#[test]
fn test_drop_stops_worker_and_releases_reader() {
    let (queue, handle) = mock_queue(quick_config());
    let session = Arc::clone(queue.session());
    drop(queue);

    assert_eq!(handle.open_contexts(), 1);
    drop(session);
    assert_eq!(handle.open_contexts(), 0);
}

#[tokio::test]
async fn test_submit_with_reply() {
    let (queue, handle) = mock_queue(quick_config());
    handle.insert_card(&UID);

    let reply = queue
        .submit_with_reply(JobId::new(3), CancellationToken::new())
        .unwrap();
    let result = timeout(PATIENCE, reply)
        .await
        .expect("reply timeout")
        .unwrap();

    assert!(result.success);
    assert_eq!(result.identifier, UID_HEX);
}

#[tokio::test]
async fn test_reply_channel_closes_when_job_is_discarded() {
    let (queue, handle) = mock_queue(quick_config());

    let running = queue
        .submit_with_reply(JobId::new(0), CancellationToken::new())
        .unwrap();
    let queued = queue
        .submit_with_reply(JobId::new(1), CancellationToken::new())
        .unwrap();

    wait_for_polls(&handle, 1);
    queue.shutdown();

    let running = timeout(PATIENCE, running).await.unwrap().unwrap();
    assert_eq!(running.error, "card read cancelled");
    assert!(timeout(PATIENCE, queued).await.unwrap().is_err());
}
