//! Error types for driver operations.
//!
//! These mirror the failure codes a PC/SC service reports. The session never
//! lets them escape a read; they are converted into
//! [`cardgate_core::Error::DeviceComm`] or [`cardgate_core::Error::Connection`]
//! first.

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors that can occur during driver calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    /// The card service is not running.
    #[error("Card service not available")]
    NoService,

    /// No reader is attached.
    #[error("No card readers available")]
    NoReadersAvailable,

    /// The named reader is unknown to the service.
    #[error("Unknown reader: {reader}")]
    UnknownReader { reader: String },

    /// A blocking call ran out of time.
    #[error("Driver call timed out")]
    Timeout,

    /// A blocking call was cancelled.
    #[error("Driver call cancelled")]
    Cancelled,

    /// No card in the reader.
    #[error("No smart card present")]
    NoSmartCard,

    /// The card was removed during the exchange.
    #[error("Card was removed")]
    RemovedCard,

    /// The handle passed to the driver is not valid.
    #[error("Invalid handle")]
    InvalidHandle,

    /// A parameter was rejected by the driver.
    #[error("Invalid parameter: {message}")]
    InvalidParameter { message: String },

    /// Device communication error.
    #[error("Communication error: {message}")]
    Communication { message: String },

    /// Generic error with custom message.
    #[error("{0}")]
    Other(String),
}

impl DriverError {
    /// Create a new unknown reader error.
    pub fn unknown_reader(reader: impl Into<String>) -> Self {
        Self::UnknownReader {
            reader: reader.into(),
        }
    }

    /// Create a new invalid parameter error.
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Create a new communication error.
    pub fn communication(message: impl Into<String>) -> Self {
        Self::Communication {
            message: message.into(),
        }
    }

    /// Create a generic error with custom message.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Convert into a core error for the named device operation.
    pub fn into_device_comm(self, operation: &str) -> cardgate_core::Error {
        cardgate_core::Error::device_comm(operation, self.to_string())
    }

    /// Convert into a core connection error, prefixing what was being set up.
    pub fn into_connection(self, stage: &str) -> cardgate_core::Error {
        cardgate_core::Error::connection(format!("{stage}: {self}"))
    }
}
