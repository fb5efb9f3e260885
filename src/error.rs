// AgriNet - Row-level greenhouse monitoring and control
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Error types for AgriNet
//!
//! This module defines the error types shared by the wire protocol and the
//! internal link channel. Encoding has no error type: every well-formed
//! message encodes.

use thiserror::Error;

/// Result type alias for AgriNet operations
pub type Result<T> = std::result::Result<T, AgrinetError>;

/// Main error type for AgriNet operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgrinetError {
    /// Decoding error
    #[error("Decoding error: {0}")]
    Decode(#[from] DecodeError),

    /// Channel error
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Errors during decoding
///
/// Any of these means the frame is dropped as a whole; nothing from a
/// rejected frame is ever applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// First byte is not a known message type
    #[error("Unknown message type: 0x{0:02x}")]
    UnknownType(u8),

    /// Trailing CRC16 does not match the preceding bytes
    #[error("CRC mismatch: expected {expected:04x}, got {actual:04x}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Buffer too short
    #[error("Buffer too short: need at least {needed} bytes, got {available}")]
    BufferTooShort { needed: usize, available: usize },

    /// Length byte disagrees with the fixed size of the message type
    #[error("Length mismatch for type 0x{msg_type:02x}: declared {declared}, expected {expected}")]
    LengthMismatch {
        msg_type: u8,
        declared: usize,
        expected: usize,
    },

    /// A field holds a value that cannot be represented
    #[error("Invalid field {field} at offset {offset}")]
    InvalidField { field: &'static str, offset: usize },
}

/// Errors related to the internal link channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Nothing arrived, or the permit was not released, within the timeout
    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Channel disconnected
    #[error("Channel disconnected: {reason}")]
    Disconnected { reason: String },

    /// Buffer full
    #[error("Channel buffer full")]
    BufferFull,
}

impl AgrinetError {
    /// Whether this error is a timeout on the link
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Channel(ChannelError::Timeout { .. }))
    }
}
