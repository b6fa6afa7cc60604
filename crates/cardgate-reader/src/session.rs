//! Exclusive reader session and the card read state machine.
//!
//! A [`ReaderSession`] owns one driver context and, while a card exchange is
//! open, one card handle. Every read runs under the session lock, taken with
//! `try_lock`: a caller that finds the reader busy gets a
//! [`LockContention`](cardgate_core::Error::LockContention) result at once
//! instead of queuing behind the read in progress.
//!
//! # States
//!
//! Each read walks the following states:
//! - `Unaware`: first status poll, with no assumption about the reader
//! - `AwaitingRemoval`: polling while the reader reports no card (and, for
//!   `already_present` reads, first while the previous card is still there)
//! - `AwaitingInsertion`: polling until a card is reported or time runs out
//! - `Connected`: card connection opened with T0 or T1
//! - `Transmitting`: GET UID command/response exchange
//! - `Done`: identifier extracted from the response
//!
//! Cancellation is checked before every poll. Any driver failure ends the
//! read with a failed [`ReadResult`]; the session stays usable.
//!
//! # Examples
//!
//! ```
//! use cardgate_core::JobId;
//! use cardgate_hardware::mock::MockDriver;
//! use cardgate_reader::ReaderSession;
//! use std::time::Duration;
//!
//! let (driver, handle) = MockDriver::new();
//! let session = ReaderSession::new(driver);
//! session.connect().unwrap();
//! session.set_timeout(Duration::from_millis(200));
//!
//! handle.insert_card(&[0x04, 0xAB, 0xCD, 0xEF]);
//! let result = session.read(JobId::new(1), false, None);
//! assert!(result.success);
//! assert_eq!(result.identifier, "04ABCDEF");
//! ```

use cardgate_core::{
    Error, JobId, ReadResult, Result,
    constants::{DEFAULT_TIMEOUT_MS, GET_UID_COMMAND, POLL_TIMEOUT_MS},
    identifier_from_response,
};
use cardgate_hardware::{CardDriver, Protocols, ReaderFlags, ReaderState};
use std::fmt;
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Phase of a single card read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadState {
    Unaware,
    AwaitingRemoval,
    AwaitingInsertion,
    Connected,
    Transmitting,
    Done,
}

impl fmt::Display for ReadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReadState::Unaware => "Unaware",
            ReadState::AwaitingRemoval => "AwaitingRemoval",
            ReadState::AwaitingInsertion => "AwaitingInsertion",
            ReadState::Connected => "Connected",
            ReadState::Transmitting => "Transmitting",
            ReadState::Done => "Done",
        };
        write!(f, "{}", name)
    }
}

/// Requester currently running a read, and the token that cancels it.
#[derive(Debug)]
struct ActiveRead {
    id: JobId,
    cancel: CancellationToken,
}

/// Everything guarded by the session lock.
struct SessionState<D: CardDriver> {
    driver: D,
    context: Option<D::Context>,
    card: Option<D::Card>,
    reader_name: Option<String>,
    timeout: Duration,
}

/// Shared, exclusive session with one card reader.
///
/// The session is `Sync` and is meant to be shared behind an `Arc`; all
/// methods take `&self`.
///
/// # Thread Safety
///
/// Reads and timeout updates use `try_lock` and never wait for the session.
/// [`connect`](Self::connect), [`reset`](Self::reset) and the accessors wait
/// for a read in progress to finish.
pub struct ReaderSession<D: CardDriver> {
    state: Mutex<SessionState<D>>,
    active: Mutex<Option<ActiveRead>>,
}

impl<D: CardDriver> ReaderSession<D> {
    /// Create a disconnected session over `driver` with a zero timeout.
    pub fn new(driver: D) -> Self {
        Self {
            state: Mutex::new(SessionState {
                driver,
                context: None,
                card: None,
                reader_name: None,
                timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            }),
            active: Mutex::new(None),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState<D>> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Reader session lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn try_lock_state(&self) -> Option<MutexGuard<'_, SessionState<D>>> {
        match self.state.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => {
                warn!("Reader session lock poisoned, recovering");
                Some(poisoned.into_inner())
            }
            Err(TryLockError::WouldBlock) => None,
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveRead>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Establish a context and select the first reader.
    ///
    /// Does nothing if the session is already connected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the context cannot be established, the
    /// readers cannot be listed or none is attached. The session is left
    /// disconnected in that case.
    pub fn connect(&self) -> Result<()> {
        self.lock_state().connect()
    }

    /// Whether a context is established and a reader selected.
    pub fn is_connected(&self) -> bool {
        let state = self.lock_state();
        state.context.is_some() && state.reader_name.is_some()
    }

    /// Name of the selected reader.
    pub fn reader_name(&self) -> Option<String> {
        self.lock_state().reader_name.clone()
    }

    /// Current poll timeout.
    pub fn timeout(&self) -> Duration {
        self.lock_state().timeout
    }

    /// Change the poll timeout.
    ///
    /// Returns `true` only if the timeout was changed: `false` means a read
    /// holds the session or the value equals the current one.
    pub fn set_timeout(&self, timeout: Duration) -> bool {
        let Some(mut state) = self.try_lock_state() else {
            debug!("Reader busy, timeout left at its current value");
            return false;
        };
        if state.timeout == timeout {
            return false;
        }
        debug!("Poll timeout {:?} -> {:?}", state.timeout, timeout);
        state.timeout = timeout;
        true
    }

    /// Cancel the read in progress if it belongs to `id`.
    ///
    /// Returns whether a read was cancelled. Requests from any other id are
    /// logged and ignored.
    pub fn cancel_for_user(&self, id: JobId) -> bool {
        let active = self.lock_active();
        match active.as_ref() {
            Some(read) if read.id == id => {
                info!("Cancelling card reader operations for {}", id);
                read.cancel.cancel();
                true
            }
            Some(read) => {
                warn!(
                    "Cannot cancel card operations for {}, reader is in use by {}",
                    id, read.id
                );
                false
            }
            None => {
                warn!("Cannot cancel card operations for {}, no read in progress", id);
                false
            }
        }
    }

    /// Id of the requester whose read is in progress.
    pub fn active_user(&self) -> Option<JobId> {
        self.lock_active().as_ref().map(|read| read.id)
    }

    /// Read the UID of the next card presented, on behalf of `id`.
    ///
    /// Blocks for up to the session timeout. `cancel` and
    /// [`cancel_for_user`](Self::cancel_for_user) both end the read early.
    /// With `already_present`, the card currently on the reader must first be
    /// taken away.
    ///
    /// Returns a failed result immediately, with error text
    /// `"failed to acquire mutex"`, when another read holds the session.
    pub fn read(
        &self,
        id: JobId,
        already_present: bool,
        cancel: Option<&CancellationToken>,
    ) -> ReadResult {
        match cancel {
            Some(token) => self.read_with_signals(id, already_present, &[token]),
            None => self.read_with_signals(id, already_present, &[]),
        }
    }

    /// Lock-guarded read observing any number of cancellation tokens.
    pub(crate) fn read_with_signals(
        &self,
        id: JobId,
        already_present: bool,
        signals: &[&CancellationToken],
    ) -> ReadResult {
        let Some(mut state) = self.try_lock_state() else {
            debug!("Read for {} rejected, reader busy", id);
            return ReadResult::failure(&Error::LockContention);
        };

        let session_cancel = CancellationToken::new();
        let _active = ActiveGuard::install(self, id, session_cancel.clone());

        let mut all = Vec::with_capacity(signals.len() + 1);
        all.push(&session_cancel);
        all.extend_from_slice(signals);

        info!("Processing card request for {}", id);
        let started = Instant::now();
        let result = state.read_uid(already_present, &all);
        match &result {
            Ok(identifier) => info!(
                "Card {} read for {} in {:?}",
                identifier,
                id,
                started.elapsed()
            ),
            Err(e) => info!("Card read for {} failed: {}", id, e),
        }
        result.into()
    }

    /// Disconnect the card and release the context, tolerating failures.
    ///
    /// Always leaves the session disconnected with a zero timeout.
    pub fn reset(&self) {
        self.lock_state().reset();
    }
}

impl<D: CardDriver> Drop for ReaderSession<D> {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.context.is_some() || state.card.is_some() {
            state.reset();
        }
    }
}

impl<D: CardDriver> fmt::Debug for ReaderSession<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderSession")
            .field("active_user", &self.active_user())
            .finish_non_exhaustive()
    }
}

/// Publishes the active requester for the duration of a read.
struct ActiveGuard<'a, D: CardDriver> {
    session: &'a ReaderSession<D>,
}

impl<'a, D: CardDriver> ActiveGuard<'a, D> {
    fn install(session: &'a ReaderSession<D>, id: JobId, cancel: CancellationToken) -> Self {
        *session.lock_active() = Some(ActiveRead { id, cancel });
        Self { session }
    }
}

impl<D: CardDriver> Drop for ActiveGuard<'_, D> {
    fn drop(&mut self) {
        *self.session.lock_active() = None;
    }
}

impl<D: CardDriver> SessionState<D> {
    fn connect(&mut self) -> Result<()> {
        if self.context.is_some() {
            warn!("Card reader already connected, skipping connection setup");
            return Ok(());
        }

        let context = self.driver.establish_context().map_err(|e| {
            error!("Failed to establish context: {}", e);
            e.into_connection("establish context")
        })?;

        let readers = match self.driver.list_readers(&context) {
            Ok(readers) => readers,
            Err(e) => {
                error!("Failed to list readers: {}", e);
                self.release_context(context);
                return Err(e.into_connection("list readers"));
            }
        };

        let Some(reader) = readers.into_iter().next() else {
            error!("No card readers available");
            self.release_context(context);
            return Err(Error::connection("no card readers available"));
        };

        info!("Selected reader: {}", reader);
        self.context = Some(context);
        self.reader_name = Some(reader);
        Ok(())
    }

    fn release_context(&mut self, context: D::Context) {
        if let Err(e) = self.driver.release_context(context) {
            warn!("Failed to release card reader context: {}", e);
        }
    }

    fn reset(&mut self) {
        match self.card.take() {
            Some(card) => {
                info!("Disconnecting from card");
                if let Err(e) = self.driver.disconnect(card) {
                    warn!("Failed to disconnect from card: {}", e);
                }
            }
            None => debug!("No card to disconnect, skipping"),
        }
        match self.context.take() {
            Some(context) => {
                info!("Releasing card reader context");
                self.release_context(context);
            }
            None => debug!("No card reader context to release, skipping"),
        }

        self.reader_name = None;
        self.timeout = Duration::from_millis(DEFAULT_TIMEOUT_MS);
    }

    fn read_uid(&mut self, already_present: bool, signals: &[&CancellationToken]) -> Result<String> {
        // A card handle left over from an interrupted exchange is closed first.
        close_card(&mut self.driver, &mut self.card);

        let (Some(context), Some(reader)) = (self.context.as_ref(), self.reader_name.as_deref())
        else {
            warn!("Not connected to any card reader, skipping UID request");
            return Err(Error::NotConnected);
        };

        let mut poller = Poller {
            driver: &mut self.driver,
            context,
            reader: ReaderState::new(reader, ReaderFlags::UNAWARE),
            phase: ReadState::Unaware,
            started: Instant::now(),
            timeout: self.timeout,
            signals,
        };
        poller.wait_for_card(already_present)?;

        poller.enter(ReadState::Connected);
        let card = self
            .driver
            .connect(context, reader, Protocols::T0 | Protocols::T1)
            .map_err(|e| {
                warn!("Failed to connect to the card: {}", e);
                e.into_device_comm("connect")
            })?;
        debug!("Connected to card on reader: {}", reader);
        let card = self.card.insert(card);

        trace!("{} -> {}", ReadState::Connected, ReadState::Transmitting);
        let response = self.driver.transmit(card, &GET_UID_COMMAND);
        close_card(&mut self.driver, &mut self.card);

        let response = response.map_err(|e| {
            warn!("Failed to transmit command APDU: {}", e);
            e.into_device_comm("transmit")
        })?;
        let identifier = identifier_from_response(&response)?;

        trace!("{} -> {}", ReadState::Transmitting, ReadState::Done);
        Ok(identifier)
    }
}

/// Disconnect an open card handle, logging failures.
fn close_card<D: CardDriver>(driver: &mut D, card: &mut Option<D::Card>) {
    if let Some(card) = card.take()
        && let Err(e) = driver.disconnect(card)
    {
        warn!("Failed to disconnect from card: {}", e);
    }
}

/// Status polling for one read.
struct Poller<'a, D: CardDriver> {
    driver: &'a mut D,
    context: &'a D::Context,
    reader: ReaderState,
    phase: ReadState,
    started: Instant,
    timeout: Duration,
    signals: &'a [&'a CancellationToken],
}

impl<D: CardDriver> Poller<'_, D> {
    /// Run `Unaware` through `AwaitingInsertion`; Ok once a card is present.
    fn wait_for_card(&mut self, already_present: bool) -> Result<()> {
        self.poll()?;

        self.enter(ReadState::AwaitingRemoval);
        if already_present {
            while self.reader.is_present() && !self.expired() {
                self.check_cancelled()?;
                self.poll()?;
            }
            if self.reader.is_present() {
                info!("Timeout exceeded, previous card was not removed");
                return Err(self.timed_out());
            }
        }
        while self.reader.is_empty() && !self.expired() {
            self.check_cancelled()?;
            self.poll()?;
        }
        debug!("Card removed");

        self.enter(ReadState::AwaitingInsertion);
        loop {
            self.check_cancelled()?;
            self.poll()?;
            if self.reader.is_present() || self.expired() {
                break;
            }
        }

        if !self.reader.is_present() {
            info!("Timeout exceeded, no card detected");
            return Err(self.timed_out());
        }
        debug!(
            "Card inserted, event state {:?}, ATR {} bytes",
            self.reader.event_state,
            self.reader.atr.len()
        );
        Ok(())
    }

    fn timed_out(&self) -> Error {
        Error::timeout(u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX))
    }

    fn enter(&mut self, phase: ReadState) {
        trace!("{} -> {}", self.phase, phase);
        self.phase = phase;
    }

    fn expired(&self) -> bool {
        self.started.elapsed() >= self.timeout
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.signals.iter().any(|token| token.is_cancelled()) {
            info!("Card read cancelled while {}", self.phase);
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn poll(&mut self) -> Result<()> {
        self.driver
            .get_status_change(
                self.context,
                Duration::from_millis(POLL_TIMEOUT_MS),
                &mut self.reader,
            )
            .map_err(|e| {
                warn!("Failed to get status change while {}: {}", self.phase, e);
                e.into_device_comm("get status change")
            })?;
        trace!("{}: event state {:?}", self.phase, self.reader.event_state);
        Ok(())
    }
}
