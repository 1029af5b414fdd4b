//! OBD-II Error Types

use thiserror::Error;

/// Errors that can occur during OBD-II communication
#[derive(Debug, Error)]
pub enum ObdError {
    /// Discovery found no serial endpoint to connect to
    #[error("No OBD-II device found")]
    NoDeviceFound,

    /// The transport could not be opened
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The liveness probe got no plausible reply; the handle stays open
    #[error("Handshake degraded: {0}")]
    HandshakeDegraded(String),

    /// Timeout waiting for response
    #[error("Timeout waiting for OBD response after {0}ms")]
    Timeout(u64),

    /// Reply could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A read was requested before `connect` succeeded
    #[error("OBD adapter is not connected")]
    DeviceNotConnected,

    /// I/O failure on an open serial handle
    #[error("Serial port error: {0}")]
    Serial(String),

    /// The link went away (unplugged, remote closed); the handle is dropped
    #[error("Serial link closed: {0}")]
    LinkClosed(String),

    /// Protocol not supported
    #[error("Protocol not supported: {0}")]
    UnsupportedProtocol(String),
}

impl ObdError {
    /// No further command can succeed without reconnecting
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, ObdError::DeviceNotConnected | ObdError::LinkClosed(_))
    }
}

impl From<std::io::Error> for ObdError {
    fn from(err: std::io::Error) -> Self {
        ObdError::Serial(err.to_string())
    }
}

/// Errors raised while turning a hex reply into typed values.
///
/// These never travel past the parse step that owns them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("hex payload has odd length {0}")]
    OddLength(usize),

    #[error("invalid hex digit in {0:?}")]
    InvalidHex(String),

    #[error("byte 0x{0:02X} is not printable ASCII")]
    NonAscii(u8),

    #[error("malformed trouble code {0:?}")]
    MalformedCode(String),

    #[error("VIN has {0} characters, expected 17")]
    IncompleteVin(usize),

    #[error("reply does not contain marker {0}")]
    MissingMarker(String),
}
