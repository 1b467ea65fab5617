use thiserror::Error;

/// Result type for WMP operations
pub type Result<T> = std::result::Result<T, WmpError>;

/// A line received from the gateway that does not follow the WMP grammar
///
/// Decoding never fails harder than this: the raw line is kept so it can be
/// logged and dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed WMP line {line:?}: {reason}")]
pub struct ParseError {
    /// The offending line, without its terminator
    pub line: String,
    /// What was wrong with it
    pub reason: String,
}

impl ParseError {
    pub(crate) fn new(line: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            reason: reason.into(),
        }
    }
}

/// Errors that can occur when talking to an IntesisBox gateway
#[derive(Error, Debug)]
pub enum WmpError {
    /// TCP connection could not be established
    #[error("Connect error: {addr}: {detail}")]
    Connect {
        /// `host:port` that was dialled
        addr: String,
        /// Socket-level failure
        detail: String,
    },

    /// The gateway rejected the handshake
    #[error("Authentication rejected: {0}")]
    Auth(String),

    /// The gateway answered but reported no usable functions
    #[error("Function discovery failed: {0}")]
    Discovery(String),

    /// No response within the deadline
    #[error("Request timeout")]
    Timeout,

    /// The gateway answered `ERR` to a command
    #[error("Value rejected by device: {command}")]
    ValueRejected {
        /// Wire form of the rejected command
        command: String,
    },

    /// Malformed wire line
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Connection was closed unexpectedly
    #[error("Connection closed")]
    ConnectionClosed,

    /// No session is ready to accept commands
    #[error("Not connected")]
    NotConnected,

    /// The function was not discovered on this device
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    /// The function cannot be written
    #[error("Function is read-only: {0}")]
    ReadOnly(String),

    /// The value is outside what the function's descriptor allows
    #[error("Invalid value {value:?} for {function}: {detail}")]
    InvalidValue {
        /// Target function
        function: String,
        /// Rejected value
        value: String,
        /// Why it was rejected
        detail: String,
    },

    /// Event receiver fell behind the broadcast channel
    #[error("Event receiver lagged by {0} events")]
    Lagged(u64),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid client configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}
