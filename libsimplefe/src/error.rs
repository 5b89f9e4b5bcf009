use std::fmt;

use thiserror::Error;

/// Failure reported by a single USB transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Stall,
    Disconnected,
    Cancelled,
    Other(String),
}

impl TransportError {
    /// Stalls and disconnects take the whole session down; anything else
    /// only costs the slot it happened on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Stall | TransportError::Disconnected)
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Stall => write!(f, "endpoint stalled"),
            TransportError::Disconnected => write!(f, "device disconnected"),
            TransportError::Cancelled => write!(f, "transfer cancelled"),
            TransportError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SfeError {
    #[error("simpleFE not found")]
    NotFound,
    #[error("USB error: {0}")]
    Usb(String),
    #[error("transfer error: {0}")]
    Transfer(TransportError),
    #[error("sample rate {requested} is out of range")]
    UnsupportedSampleRate { requested: u32 },
    #[error("simpleFE is running with divider {current_divider}, cannot switch to {requested_divider}")]
    Busy {
        current_divider: u8,
        requested_divider: u8,
    },
    #[error("board clock is not stable ({0} Hz)")]
    ClockUnstable(u32),
    #[error("sample rate too high: {bytes_per_sec} bytes/s exceeds {limit}")]
    RateTooHigh { bytes_per_sec: u64, limit: u64 },
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("contract violation: {0}")]
    Contract(&'static str),
    #[error("device session has failed")]
    DeviceFailed,
}

impl From<TransportError> for SfeError {
    fn from(e: TransportError) -> Self {
        SfeError::Transfer(e)
    }
}

pub type Result<T> = std::result::Result<T, SfeError>;
