//! Single-worker FIFO of card read jobs.
//!
//! Producers on any thread [`submit`](JobQueue::submit) jobs; one dedicated
//! worker thread takes them in order and runs each as a lock-guarded read on
//! the shared [`ReaderSession`]. Between jobs the worker pauses for the
//! configured settle delay so a presented card can be taken away.
//!
//! Jobs travel over a bounded `tokio::sync::mpsc` channel. `submit` retries
//! once after `enqueue_wait` when the channel is full and then reports
//! [`Error::QueueFull`] instead of dropping the job silently.

use crate::config::QueueConfig;
use crate::session::ReaderSession;
use cardgate_core::{Error, JobId, ReadResult, Result, constants::WORKER_THREAD_NAME};
use cardgate_hardware::CardDriver;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Granularity of the shutdown check while settling between jobs.
const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

type MessageCallback = Box<dyn FnOnce(String) + Send + 'static>;
type FinishCallback = Box<dyn FnOnce(ReadResult) + Send + 'static>;

/// One queued read request.
///
/// Both callbacks run on the worker thread, `on_message` first, once the job
/// has been read. A job that never reaches the worker runs neither.
pub struct Job {
    id: JobId,
    on_message: MessageCallback,
    on_finish: FinishCallback,
    cancel: CancellationToken,
}

impl Job {
    pub fn new<M, F>(id: JobId, on_message: M, on_finish: F, cancel: CancellationToken) -> Self
    where
        M: FnOnce(String) + Send + 'static,
        F: FnOnce(ReadResult) + Send + 'static,
    {
        Self {
            id,
            on_message: Box::new(on_message),
            on_finish: Box::new(on_finish),
            cancel,
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("Job queue lock poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Serializes card reads from many producers onto one worker thread.
///
/// # Examples
///
/// ```
/// use cardgate_core::JobId;
/// use cardgate_hardware::mock::MockDriver;
/// use cardgate_reader::{JobQueue, QueueConfig};
/// use std::sync::mpsc;
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
///
/// let (driver, handle) = MockDriver::new();
/// handle.insert_card(&[0xDE, 0xAD, 0xBE, 0xEF]);
///
/// let config = QueueConfig::default()
///     .with_timeout(Duration::from_secs(1))
///     .with_settle_delay(Duration::ZERO);
/// let queue = JobQueue::new(driver, config).unwrap();
///
/// let (tx, rx) = mpsc::channel();
/// queue
///     .submit(JobId::new(1), |_| {}, move |result| tx.send(result).unwrap(), CancellationToken::new())
///     .unwrap();
///
/// let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
/// assert_eq!(result.identifier, "DEADBEEF");
/// queue.shutdown();
/// ```
pub struct JobQueue<D: CardDriver + 'static> {
    session: Arc<ReaderSession<D>>,
    /// `None` once the queue is shut down.
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    shutdown: CancellationToken,
    /// Held across `join` so concurrent shutdowns all wait for the worker.
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
    running: Arc<AtomicBool>,
    config: QueueConfig,
}

impl<D: CardDriver + 'static> JobQueue<D> {
    /// Connect a session over `driver` and start the worker.
    ///
    /// A failed connection is logged and not fatal: jobs then finish with a
    /// not-connected result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Worker`] if the worker thread cannot be spawned.
    pub fn new(driver: D, config: QueueConfig) -> Result<Self> {
        let session = Arc::new(ReaderSession::new(driver));
        if let Err(e) = session.connect() {
            error!("Card reader unavailable, queued reads will fail: {}", e);
        }
        session.set_timeout(config.timeout);

        let capacity = config.capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let shutdown = CancellationToken::new();
        let running = Arc::new(AtomicBool::new(true));

        let worker = Worker {
            session: Arc::clone(&session),
            receiver,
            shutdown: shutdown.clone(),
            settle_delay: config.settle_delay,
            running: RunningFlag(Arc::clone(&running)),
        };
        let handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || worker.run())
            .map_err(|e| Error::Worker {
                message: e.to_string(),
            })?;
        let worker_id = handle.thread().id();

        info!(
            "Job queue started (capacity {}, timeout {:?})",
            capacity, config.timeout
        );

        Ok(Self {
            session,
            sender: Mutex::new(Some(sender)),
            shutdown,
            worker: Mutex::new(Some(handle)),
            worker_id,
            running,
            config,
        })
    }

    /// Queue a read for `id`.
    ///
    /// When the queue is full, waits `enqueue_wait` and tries once more.
    ///
    /// # Errors
    ///
    /// - [`Error::QueueFull`] if the retry also finds the queue full; the job
    ///   is dropped and neither callback runs
    /// - [`Error::QueueClosed`] after [`shutdown`](Self::shutdown)
    pub fn submit<M, F>(
        &self,
        id: JobId,
        on_message: M,
        on_finish: F,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        M: FnOnce(String) + Send + 'static,
        F: FnOnce(ReadResult) + Send + 'static,
    {
        self.enqueue(Job::new(id, on_message, on_finish, cancel))
    }

    /// Queue a read and receive its result through a oneshot channel.
    ///
    /// The receiver can be awaited or used with `blocking_recv`. It reports
    /// an error if the job is discarded at shutdown.
    pub fn submit_with_reply(
        &self,
        id: JobId,
        cancel: CancellationToken,
    ) -> Result<oneshot::Receiver<ReadResult>> {
        let (tx, rx) = oneshot::channel();
        self.submit(
            id,
            move |message| debug!("Job {}: {}", id, message),
            move |result| {
                if tx.send(result).is_err() {
                    debug!("Reply receiver for job {} dropped", id);
                }
            },
            cancel,
        )?;
        Ok(rx)
    }

    /// Queue a prepared [`Job`].
    pub fn enqueue(&self, job: Job) -> Result<()> {
        let id = job.id;
        if self.shutdown.is_cancelled() {
            debug!("Job {} rejected, queue is shut down", id);
            return Err(Error::QueueClosed);
        }
        let Some(sender) = lock(&self.sender).clone() else {
            debug!("Job {} rejected, queue is shut down", id);
            return Err(Error::QueueClosed);
        };

        let job = match sender.try_send(job) {
            Ok(()) => {
                debug!("Job {} queued", id);
                return Ok(());
            }
            Err(TrySendError::Full(job)) => job,
            Err(TrySendError::Closed(_)) => return Err(Error::QueueClosed),
        };

        // Full: give the worker one chance to take a job, then retry once.
        let wait = self.config.enqueue_wait;
        thread::sleep(wait);
        match sender.try_send(job) {
            Ok(()) => {
                debug!("Job {} queued after waiting {:?}", id, wait);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                warn!("Job queue full, dropping job {}", id);
                Err(Error::QueueFull {
                    job_id: id,
                    waited_ms: u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                })
            }
            Err(TrySendError::Closed(_)) => Err(Error::QueueClosed),
        }
    }

    /// Stop the worker and discard jobs that have not started.
    ///
    /// A read in progress is cancelled and still reports its result. Every
    /// caller returns only once the worker has exited, except a call made
    /// from a job callback, which cannot wait for its own thread.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        if lock(&self.sender).take().is_some() {
            info!("Job queue closing");
        }

        if thread::current().id() == self.worker_id {
            debug!("Shutdown requested from the worker thread, join left to other callers");
            return;
        }

        let mut worker = lock(&self.worker);
        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                error!("Job queue worker terminated abnormally");
            }
            info!("Job queue stopped");
        }
    }

    /// Session the worker reads with. Direct reads on it compete for the
    /// same lock.
    pub fn session(&self) -> &Arc<ReaderSession<D>> {
        &self.session
    }

    /// Jobs waiting to be taken by the worker.
    pub fn len(&self) -> usize {
        lock(&self.sender)
            .as_ref()
            .map_or(0, |sender| sender.max_capacity() - sender.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the worker thread is still in its loop.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }
}

impl<D: CardDriver + 'static> Drop for JobQueue<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<D: CardDriver + 'static> fmt::Debug for JobQueue<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("queued", &self.len())
            .field("running", &self.is_running())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Clears the running flag when the worker leaves its loop.
struct RunningFlag(Arc<AtomicBool>);

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Worker<D: CardDriver> {
    session: Arc<ReaderSession<D>>,
    receiver: mpsc::Receiver<Job>,
    shutdown: CancellationToken,
    settle_delay: Duration,
    running: RunningFlag,
}

impl<D: CardDriver> Worker<D> {
    fn run(mut self) {
        info!("Card read worker started");
        let mut discarded = 0usize;

        // Ends once every sender is gone and the channel is drained.
        while let Some(job) = self.receiver.blocking_recv() {
            if self.shutdown.is_cancelled() {
                debug!("Discarding job {}", job.id);
                discarded += 1;
                continue;
            }

            let id = job.id;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.process(job)));
            if let Err(payload) = outcome {
                error!(
                    "Worker panicked while processing job {}: {}",
                    id,
                    panic_message(payload.as_ref())
                );
            }

            if !self.settle() {
                self.receiver.close();
            }
        }

        if discarded > 0 {
            info!("Discarded {} queued jobs", discarded);
        }
        info!("Card read worker stopped");
        drop(self.running);
    }

    fn process(&self, job: Job) {
        let Job {
            id,
            on_message,
            on_finish,
            cancel,
        } = job;
        debug!("Processing job {}", id);

        let result = self
            .session
            .read_with_signals(id, false, &[&cancel, &self.shutdown]);
        on_message(format!("Card ID: {}", result.identifier));
        on_finish(result);
    }

    /// Pause between jobs. Returns false if shutdown was requested.
    fn settle(&self) -> bool {
        let deadline = Instant::now() + self.settle_delay;
        loop {
            if self.shutdown.is_cancelled() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            thread::sleep(remaining.min(SETTLE_POLL_INTERVAL));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
