// AgriNet Coordinator - Cross-link orchestration layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Error types for AgriNet Coordinator

use thiserror::Error;

/// Main error type for coordinator operations
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// Connect or send failure on a transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// A bounded wait expired
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    /// Frame rejected by the codec
    #[error("Decode error: {0}")]
    Decode(#[from] agrinet::DecodeError),

    /// Internal link failure
    #[error("Internal link error: {0}")]
    Link(#[from] agrinet::AgrinetError),

    /// Malformed CoAP datagram
    #[error("CoAP error: {0}")]
    Coap(#[from] crate::coap::CoapError),

    /// A bounded pool or table is full
    #[error("Capacity exceeded: {what} (max {max})")]
    CapacityExceeded { what: &'static str, max: usize },

    /// Group id outside 1..=MAX_GROUPS
    #[error("Group out of range: {0}")]
    GroupOutOfRange(u8),

    /// Non-volatile storage failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<std::io::Error> for CoordinatorError {
    fn from(e: std::io::Error) -> Self {
        CoordinatorError::Transport(e.to_string())
    }
}

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;
