use crate::{
    Result,
    constants::STATUS_WORD_LEN,
    error::Error,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a requester (a queued job or a direct caller).
///
/// The session only uses it to decide who may cancel the read in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(u32);

impl JobId {
    pub const fn new(id: u32) -> Self {
        JobId(id)
    }

    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl From<u32> for JobId {
    fn from(id: u32) -> Self {
        JobId(id)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a card read as seen by callers.
///
/// Failed, cancelled and timed-out reads all look the same apart from the
/// `error` text: `identifier` is empty and `success` is false.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReadResult {
    /// Uppercase hex UID of the card, empty on failure.
    pub identifier: String,

    /// Whether the command/response exchange completed.
    pub success: bool,

    /// Reason for failure, empty on success.
    pub error: String,
}

impl ReadResult {
    /// Successful read carrying the card identifier.
    pub fn success(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            success: true,
            error: String::new(),
        }
    }

    /// Failed read; the error is kept only as text.
    pub fn failure(error: &Error) -> Self {
        Self {
            identifier: String::new(),
            success: false,
            error: error.to_string(),
        }
    }
}

impl From<Result<String>> for ReadResult {
    fn from(result: Result<String>) -> Self {
        match result {
            Ok(identifier) => Self::success(identifier),
            Err(error) => Self::failure(&error),
        }
    }
}

/// Format bytes as uppercase hex without separators.
///
/// # Examples
///
/// ```
/// use cardgate_core::uid_hex;
///
/// assert_eq!(uid_hex(&[0x04, 0xAB, 0xCD, 0xEF]), "04ABCDEF");
/// assert_eq!(uid_hex(&[]), "");
/// ```
pub fn uid_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

/// Extract the card identifier from a GET UID response.
///
/// The last [`STATUS_WORD_LEN`] bytes are the status word and are dropped;
/// the remainder is hex encoded.
///
/// # Errors
///
/// Returns [`Error::DeviceComm`] if the response is shorter than the status
/// word.
///
/// # Examples
///
/// ```
/// use cardgate_core::identifier_from_response;
///
/// let id = identifier_from_response(&[0x04, 0xAB, 0xCD, 0xEF, 0x90, 0x00]).unwrap();
/// assert_eq!(id, "04ABCDEF");
/// ```
pub fn identifier_from_response(response: &[u8]) -> Result<String> {
    let data_len = response.len().checked_sub(STATUS_WORD_LEN).ok_or_else(|| {
        Error::device_comm(
            "transmit",
            format!(
                "response of {} bytes is shorter than the status word",
                response.len()
            ),
        )
    })?;
    Ok(uid_hex(&response[..data_len]))
}

/// Parse a hex identifier into an integer.
///
/// Only identifiers of up to 4 bytes fit; longer or malformed input gives
/// `None`.
///
/// # Examples
///
/// ```
/// use cardgate_core::uid_to_u32;
///
/// assert_eq!(uid_to_u32("01020304"), Some(16909060));
/// assert_eq!(uid_to_u32("0102030405"), None);
/// ```
pub fn uid_to_u32(identifier: &str) -> Option<u32> {
    if identifier.is_empty() {
        return None;
    }
    u32::from_str_radix(identifier, 16).ok()
}
