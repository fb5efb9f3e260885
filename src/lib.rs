// AgriNet - Row-level greenhouse monitoring and control
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # AgriNet - wire protocol for row-level greenhouse control
//!
//! Sensor peers report to a coordinator over a short-range radio. The
//! coordinator aggregates readings per group (row), drives fans, irrigation
//! and lights, and hands everything to a relay MCU that talks to the cloud.
//!
//! This crate holds what both ends of those links share:
//!
//! - [`protocol`]: message types, records and constants
//! - [`codec`]: CRC16-framed encoding, decoding and stream reassembly
//! - [`channel`]: frame channel abstraction and in-memory links
//! - [`ack`]: one-in-flight acknowledged sending
//! - [`recovery`]: retry strategies
//!
//! ## Quick Start
//!
//! ```rust
//! use agrinet::{decode, encode, Message, ResultCode};
//!
//! let frame = encode(&Message::OperationResult(ResultCode::GROUP_MEAN_OK));
//! assert_eq!(frame.len(), 6);
//!
//! let decoded = decode(&frame).unwrap();
//! assert_eq!(decoded, Message::OperationResult(ResultCode::GROUP_MEAN_OK));
//! ```
//!
//! The orchestration state machines live in `agrinet-coordinator`.

pub mod ack;
pub mod channel;
pub mod codec;
pub mod error;
pub mod protocol;
pub mod recovery;

pub use ack::{AckPermit, AckStats, AckedSender, DEFAULT_ACK_TIMEOUT};
pub use channel::{Channel, ChannelMetrics, ChannelPair, Frame, LossyChannel, MemoryChannel};
pub use codec::{crc16, decode, encode, peek_type, FrameAssembler};
pub use error::{AgrinetError, ChannelError, DecodeError, Result};
pub use protocol::{
    group_index, is_valid_group, ActuatorCommand, ActuatorState, CloudAggregate, ControlUpdate,
    GroupAggregate, LinkKind, MacAddress, Message, MessageType, RawSample, ResultCode,
    ThresholdUpdate, MAC_ADDRESS_LEN, MAX_FRAME_SIZE, MAX_GROUPS, SOIL_SATURATED,
};
pub use recovery::{with_retry, RetryStrategy};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_relay_batch_over_pair() {
        let mut pair = ChannelPair::new();
        let batch = [
            Message::TimestampSync,
            Message::GroupAggregate(GroupAggregate {
                group: 1,
                temperature: 2500,
                registered: true,
                ..Default::default()
            }),
            Message::ReadyToRelay,
        ];
        for message in &batch {
            pair.coordinator.send(encode(message)).unwrap();
        }
        pair.transfer();

        let mut received = Vec::new();
        while let Ok(frame) = pair.relay.receive(std::time::Duration::ZERO) {
            received.push(decode(&frame).unwrap());
        }
        assert_eq!(received, batch);
    }
}
