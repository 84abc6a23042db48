use std::array::TryFromSliceError;
use std::io;
use thiserror::Error;

use crate::auth::AuthState;

/// The primary error type for the `pumplink` library.
#[derive(Error, Debug)]
pub enum PumpError {
    #[error("Pump is not connected")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Timeout waiting for pump response: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("Checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    Checksum { expected: u16, actual: u16 },

    #[error("Invalid length")]
    InvalidLength,

    #[error("Insufficient data: expected at least {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Message of {0} bytes does not fit in 16 chunks")]
    MessageTooLarge(usize),

    #[error("Unknown opcode {0} on this characteristic")]
    UnknownOpcode(u8),

    #[error("Malformed response for {0}")]
    MalformedResponse(&'static str),

    #[error("JPAKE error: {0}")]
    Jpake(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Operation not allowed in authentication state {0:?}")]
    InvalidState(AuthState),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Sink error: {0}")]
    Sink(String),
}

impl From<TryFromSliceError> for PumpError {
    fn from(_: TryFromSliceError) -> Self {
        PumpError::InvalidLength
    }
}
