//! Driver trait and the reader state it reports.
//!
//! [`CardDriver`] is the whole surface the reader session needs from a
//! platform card service: context lifetime, reader enumeration, status
//! polling, and the card connect/transmit/disconnect exchange. Everything is
//! blocking; the session decides how long to keep polling.

use crate::Result;
use std::fmt;
use std::ops::BitOr;
use std::time::Duration;

/// Reader state bits as reported by a status poll.
///
/// The low 16 bits carry state flags; the upper 16 bits carry the event
/// counter some services maintain (e.g. `0x0016_0012` is the 0x16th event,
/// `EMPTY | CHANGED`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ReaderFlags(u32);

impl ReaderFlags {
    /// Caller knows nothing about the reader; any state counts as a change.
    pub const UNAWARE: Self = Self(0x0000);
    pub const IGNORE: Self = Self(0x0001);
    pub const CHANGED: Self = Self(0x0002);
    pub const UNKNOWN: Self = Self(0x0004);
    pub const UNAVAILABLE: Self = Self(0x0008);
    /// No card in the reader.
    pub const EMPTY: Self = Self(0x0010);
    /// A card is in the reader.
    pub const PRESENT: Self = Self(0x0020);
    pub const ATRMATCH: Self = Self(0x0040);
    pub const EXCLUSIVE: Self = Self(0x0080);
    pub const INUSE: Self = Self(0x0100);
    pub const MUTE: Self = Self(0x0200);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set.
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Event counter kept in the upper 16 bits.
    pub const fn event_count(&self) -> u16 {
        (self.0 >> 16) as u16
    }
}

impl BitOr for ReaderFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for ReaderFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReaderFlags(0x{:X})", self.0)
    }
}

/// Transmission protocols a card connection may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Protocols(u32);

impl Protocols {
    pub const T0: Self = Self(0x0001);
    pub const T1: Self = Self(0x0002);
    pub const RAW: Self = Self(0x0004);

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Protocols {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// State of one reader, updated in place by
/// [`CardDriver::get_status_change`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderState {
    /// Reader being watched.
    pub name: String,

    /// State the caller believes the reader is in.
    pub current_state: ReaderFlags,

    /// State reported by the last poll.
    pub event_state: ReaderFlags,

    /// Answer-To-Reset of the card, if one is present.
    pub atr: Vec<u8>,
}

impl ReaderState {
    /// Create a state for `name` starting from `current_state`.
    pub fn new(name: impl Into<String>, current_state: ReaderFlags) -> Self {
        Self {
            name: name.into(),
            current_state,
            event_state: ReaderFlags::UNAWARE,
            atr: Vec::new(),
        }
    }

    /// Last poll reported no card.
    pub fn is_empty(&self) -> bool {
        self.event_state.contains(ReaderFlags::EMPTY)
    }

    /// Last poll reported a card.
    pub fn is_present(&self) -> bool {
        self.event_state.contains(ReaderFlags::PRESENT)
    }
}

/// Platform card service bindings.
///
/// One implementation exists per backend: [`MockDriver`](crate::mock::MockDriver)
/// for tests and, with the `hardware-pcsc` feature,
/// [`PcscDriver`](crate::pcsc_driver::PcscDriver).
///
/// Handles are owned values: releasing or disconnecting consumes them, so a
/// released handle cannot be used again.
///
/// # Examples
///
/// ```
/// use cardgate_hardware::mock::MockDriver;
/// use cardgate_hardware::{CardDriver, ReaderFlags, ReaderState};
/// use std::time::Duration;
///
/// let (mut driver, handle) = MockDriver::new();
/// handle.insert_card(&[0x04, 0xAB, 0xCD, 0xEF]);
///
/// let ctx = driver.establish_context().unwrap();
/// let readers = driver.list_readers(&ctx).unwrap();
///
/// let mut state = ReaderState::new(readers[0].clone(), ReaderFlags::UNAWARE);
/// driver.get_status_change(&ctx, Duration::ZERO, &mut state).unwrap();
/// assert!(state.is_present());
/// ```
pub trait CardDriver: Send {
    /// Handle to the card service.
    type Context: Send;

    /// Handle to a connected card.
    type Card: Send;

    /// Open a context with the card service.
    fn establish_context(&mut self) -> Result<Self::Context>;

    /// List reader names known to the service, in service order.
    fn list_readers(&mut self, context: &Self::Context) -> Result<Vec<String>>;

    /// Poll for a change relative to `state.current_state`.
    ///
    /// Fills `state.event_state` and `state.atr`.
    fn get_status_change(
        &mut self,
        context: &Self::Context,
        timeout: Duration,
        state: &mut ReaderState,
    ) -> Result<()>;

    /// Connect in shared mode to the card in `reader`.
    fn connect(
        &mut self,
        context: &Self::Context,
        reader: &str,
        protocols: Protocols,
    ) -> Result<Self::Card>;

    /// Send a command APDU and return the full response, status word included.
    fn transmit(&mut self, card: &Self::Card, command: &[u8]) -> Result<Vec<u8>>;

    /// Disconnect from the card, leaving it powered.
    fn disconnect(&mut self, card: Self::Card) -> Result<()>;

    /// Release the context.
    fn release_context(&mut self, context: Self::Context) -> Result<()>;
}
