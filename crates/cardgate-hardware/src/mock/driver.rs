//! Mock card driver for testing and development.
//!
//! The driver and its handle share one simulated reader. Tests hold the
//! handle to insert and remove cards, inject failures and count calls while
//! the driver itself is owned by a reader session on another thread.

use crate::{
    Result,
    error::DriverError,
    traits::{CardDriver, Protocols, ReaderFlags, ReaderState},
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Reader name reported by a fresh mock.
pub const MOCK_READER_NAME: &str = "Mock PC/SC Reader 00 00";

/// ATR reported while a card is present.
const MOCK_ATR: [u8; 11] = [
    0x3B, 0x8F, 0x80, 0x01, 0x80, 0x4F, 0x0C, 0xA0, 0x00, 0x00, 0x03,
];

/// Status word appended to every successful response.
const SW_SUCCESS: [u8; 2] = [0x90, 0x00];

/// Driver calls that can be counted or made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    EstablishContext,
    ListReaders,
    GetStatusChange,
    Connect,
    Transmit,
    Disconnect,
    ReleaseContext,
}

/// Context handle issued by [`MockDriver`].
#[derive(Debug, PartialEq, Eq)]
pub struct MockContext(u64);

/// Card handle issued by [`MockDriver`].
#[derive(Debug, PartialEq, Eq)]
pub struct MockCard(u64);

#[derive(Debug)]
struct Failure {
    error: DriverError,
    /// `None` fails every call until cleared.
    remaining: Option<u32>,
}

#[derive(Debug)]
struct MockState {
    readers: Vec<String>,
    card_uid: Option<Vec<u8>>,
    response: Option<Vec<u8>>,
    poll_latency: Duration,
    failures: HashMap<MockOperation, Failure>,
    calls: HashMap<MockOperation, usize>,
    open_contexts: HashSet<u64>,
    open_cards: HashSet<u64>,
    last_command: Option<Vec<u8>>,
    last_protocols: Option<Protocols>,
    next_handle: u64,
}

impl MockState {
    fn new(reader: String) -> Self {
        Self {
            readers: vec![reader],
            card_uid: None,
            response: None,
            poll_latency: Duration::from_millis(1),
            failures: HashMap::new(),
            calls: HashMap::new(),
            open_contexts: HashSet::new(),
            open_cards: HashSet::new(),
            last_command: None,
            last_protocols: None,
            next_handle: 1,
        }
    }

    /// Count the call and return the injected failure, if any.
    fn enter(&mut self, operation: MockOperation) -> Result<()> {
        *self.calls.entry(operation).or_insert(0) += 1;

        let Some(failure) = self.failures.get_mut(&operation) else {
            return Ok(());
        };
        let error = failure.error.clone();
        let exhausted = match failure.remaining.as_mut() {
            None => false,
            Some(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
        };
        if exhausted {
            self.failures.remove(&operation);
        }
        Err(error)
    }

    fn issue_handle(&mut self) -> u64 {
        let id = self.next_handle;
        self.next_handle += 1;
        id
    }

    fn check_context(&self, context: &MockContext) -> Result<()> {
        if self.open_contexts.contains(&context.0) {
            Ok(())
        } else {
            Err(DriverError::InvalidHandle)
        }
    }
}

/// Simulated card service.
///
/// # Examples
///
/// ```
/// use cardgate_hardware::mock::{MockDriver, MockOperation};
/// use cardgate_hardware::CardDriver;
///
/// let (mut driver, handle) = MockDriver::new();
/// handle.insert_card(&[0x01, 0x02, 0x03, 0x04]);
///
/// let ctx = driver.establish_context().unwrap();
/// let reader = driver.list_readers(&ctx).unwrap().remove(0);
/// let card = driver
///     .connect(&ctx, &reader, cardgate_hardware::Protocols::T0)
///     .unwrap();
/// let response = driver.transmit(&card, &[0xFF, 0xCA, 0x00, 0x00, 0x00]).unwrap();
/// assert_eq!(response, vec![0x01, 0x02, 0x03, 0x04, 0x90, 0x00]);
/// assert_eq!(handle.calls(MockOperation::Transmit), 1);
/// ```
#[derive(Debug)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    /// Create a mock driver with one reader named [`MOCK_READER_NAME`].
    ///
    /// Returns the driver and a handle controlling the simulated reader.
    pub fn new() -> (Self, MockDriverHandle) {
        Self::with_reader(MOCK_READER_NAME)
    }

    /// Create a mock driver whose single reader has a custom name.
    pub fn with_reader(name: impl Into<String>) -> (Self, MockDriverHandle) {
        let state = Arc::new(Mutex::new(MockState::new(name.into())));
        (
            Self {
                state: Arc::clone(&state),
            },
            MockDriverHandle { state },
        )
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        lock(&self.state)
    }
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CardDriver for MockDriver {
    type Context = MockContext;
    type Card = MockCard;

    fn establish_context(&mut self) -> Result<MockContext> {
        let mut state = self.state();
        state.enter(MockOperation::EstablishContext)?;
        let id = state.issue_handle();
        state.open_contexts.insert(id);
        Ok(MockContext(id))
    }

    fn list_readers(&mut self, context: &MockContext) -> Result<Vec<String>> {
        let mut state = self.state();
        state.enter(MockOperation::ListReaders)?;
        state.check_context(context)?;
        if state.readers.is_empty() {
            return Err(DriverError::NoReadersAvailable);
        }
        Ok(state.readers.clone())
    }

    fn get_status_change(
        &mut self,
        context: &MockContext,
        _timeout: Duration,
        reader_state: &mut ReaderState,
    ) -> Result<()> {
        let latency = {
            let mut state = self.state();
            state.enter(MockOperation::GetStatusChange)?;
            state.check_context(context)?;
            if !state.readers.contains(&reader_state.name) {
                return Err(DriverError::unknown_reader(reader_state.name.clone()));
            }

            let (flags, atr) = match state.card_uid {
                Some(_) => (ReaderFlags::PRESENT, MOCK_ATR.to_vec()),
                None => (ReaderFlags::EMPTY, Vec::new()),
            };
            reader_state.event_state = if reader_state.current_state == flags {
                flags
            } else {
                flags | ReaderFlags::CHANGED
            };
            reader_state.atr = atr;
            state.poll_latency
        };

        // Outside the lock so the handle can change the card meanwhile.
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        Ok(())
    }

    fn connect(
        &mut self,
        context: &MockContext,
        reader: &str,
        protocols: Protocols,
    ) -> Result<MockCard> {
        let mut state = self.state();
        state.enter(MockOperation::Connect)?;
        state.check_context(context)?;
        if !state.readers.iter().any(|r| r == reader) {
            return Err(DriverError::unknown_reader(reader));
        }
        if state.card_uid.is_none() {
            return Err(DriverError::NoSmartCard);
        }
        state.last_protocols = Some(protocols);
        let id = state.issue_handle();
        state.open_cards.insert(id);
        Ok(MockCard(id))
    }

    fn transmit(&mut self, card: &MockCard, command: &[u8]) -> Result<Vec<u8>> {
        let mut state = self.state();
        state.enter(MockOperation::Transmit)?;
        if !state.open_cards.contains(&card.0) {
            return Err(DriverError::InvalidHandle);
        }
        state.last_command = Some(command.to_vec());

        if let Some(response) = &state.response {
            return Ok(response.clone());
        }
        let uid = state.card_uid.clone().ok_or(DriverError::RemovedCard)?;
        let mut response = uid;
        response.extend_from_slice(&SW_SUCCESS);
        Ok(response)
    }

    fn disconnect(&mut self, card: MockCard) -> Result<()> {
        let mut state = self.state();
        // The handle is gone whatever the outcome, as with a real service.
        let known = state.open_cards.remove(&card.0);
        state.enter(MockOperation::Disconnect)?;
        if !known {
            return Err(DriverError::InvalidHandle);
        }
        Ok(())
    }

    fn release_context(&mut self, context: MockContext) -> Result<()> {
        let mut state = self.state();
        let known = state.open_contexts.remove(&context.0);
        state.enter(MockOperation::ReleaseContext)?;
        if !known {
            return Err(DriverError::InvalidHandle);
        }
        Ok(())
    }
}

/// Handle for controlling a [`MockDriver`].
///
/// Cloning the handle shares the same simulated reader.
#[derive(Debug, Clone)]
pub struct MockDriverHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockDriverHandle {
    fn state(&self) -> MutexGuard<'_, MockState> {
        lock(&self.state)
    }

    /// Place a card with the given UID on the reader.
    pub fn insert_card(&self, uid: &[u8]) {
        self.state().card_uid = Some(uid.to_vec());
    }

    /// Take the card off the reader.
    pub fn remove_card(&self) {
        self.state().card_uid = None;
    }

    /// Replace the reader list. An empty list makes enumeration fail.
    pub fn set_readers(&self, readers: Vec<String>) {
        self.state().readers = readers;
    }

    /// Answer every transmit with `response` verbatim instead of UID + 90 00.
    pub fn set_response(&self, response: Vec<u8>) {
        self.state().response = Some(response);
    }

    /// Simulated time each status poll takes.
    pub fn set_poll_latency(&self, latency: Duration) {
        self.state().poll_latency = latency;
    }

    /// Make the next `times` calls of `operation` fail with `error`.
    pub fn fail_times(&self, operation: MockOperation, error: DriverError, times: u32) {
        if times == 0 {
            return;
        }
        self.state().failures.insert(
            operation,
            Failure {
                error,
                remaining: Some(times),
            },
        );
    }

    /// Make the next call of `operation` fail with `error`.
    pub fn fail_next(&self, operation: MockOperation, error: DriverError) {
        self.fail_times(operation, error, 1);
    }

    /// Make every call of `operation` fail until [`clear_failures`](Self::clear_failures).
    pub fn fail_always(&self, operation: MockOperation, error: DriverError) {
        self.state().failures.insert(
            operation,
            Failure {
                error,
                remaining: None,
            },
        );
    }

    /// Drop all injected failures.
    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Number of calls made to `operation` so far.
    pub fn calls(&self, operation: MockOperation) -> usize {
        self.state().calls.get(&operation).copied().unwrap_or(0)
    }

    /// Wait until `operation` has been called at least `count` times.
    ///
    /// Returns false if `timeout` elapses first.
    pub fn wait_for_calls(&self, operation: MockOperation, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.calls(operation) >= count {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Contexts established and not yet released.
    pub fn open_contexts(&self) -> usize {
        self.state().open_contexts.len()
    }

    /// Card connections not yet disconnected.
    pub fn open_cards(&self) -> usize {
        self.state().open_cards.len()
    }

    /// Last command sent with transmit.
    pub fn last_command(&self) -> Option<Vec<u8>> {
        self.state().last_command.clone()
    }

    /// Protocol mask requested by the last connect.
    pub fn last_protocols(&self) -> Option<Protocols> {
        self.state().last_protocols
    }
}
