// AgriNet Coordinator - Cross-link orchestration layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Inbound wide-area dispatch
//!
//! Notifications from the collector are accepted only when they carry the
//! observe token. Control and threshold updates are applied to the engine
//! (which persists them); internal-link frames are forwarded unmodified.

use crate::coap::CoapPacket;
use crate::control::{lock_engine, SharedEngine};
use crate::error::Result;
use crate::session::WanTransport;
use agrinet::{decode, DecodeError, Frame, LinkKind, Message, MessageType};
use log::{debug, info, warn};

/// Why a datagram was dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Not a CoAP message
    Malformed,
    /// Token absent or different from the observe token
    TokenMismatch,
    /// No payload
    Empty,
    /// Payload failed to decode
    Invalid(DecodeError),
    /// Update rejected by the engine
    Rejected {
        /// Group named by the update
        group: u8,
    },
    /// Valid message with no inbound meaning
    Unexpected(MessageType),
}

/// Result of handling one datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// A group's configuration changed
    Applied {
        /// The group
        group: u8,
    },
    /// An internal-link frame was passed on
    Forwarded(MessageType),
    /// Nothing happened
    Dropped(DropReason),
}

/// Inbound counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundStats {
    /// Datagrams handled
    pub received: u64,
    /// Updates applied
    pub applied: u64,
    /// Frames forwarded
    pub forwarded: u64,
    /// Datagrams dropped
    pub dropped: u64,
}

type Forwarder = Box<dyn FnMut(Frame) + Send>;

/// Dispatches collector notifications
pub struct InboundDispatcher {
    engine: SharedEngine,
    token: [u8; 2],
    forward: Option<Forwarder>,
    stats: InboundStats,
}

impl InboundDispatcher {
    /// Dispatcher accepting `observe_token`
    pub fn new(engine: SharedEngine, observe_token: u16) -> Self {
        Self {
            engine,
            token: observe_token.to_le_bytes(),
            forward: None,
            stats: InboundStats::default(),
        }
    }

    /// Where internal-link frames go
    pub fn with_forwarder(mut self, forward: impl FnMut(Frame) + Send + 'static) -> Self {
        self.forward = Some(Box::new(forward));
        self
    }

    /// Counters
    pub fn stats(&self) -> &InboundStats {
        &self.stats
    }

    /// Drain every pending datagram of `transport`
    pub fn poll(&mut self, transport: &dyn WanTransport) -> Result<Vec<InboundOutcome>> {
        let mut outcomes = Vec::new();
        while let Some(datagram) = transport.try_recv()? {
            outcomes.push(self.handle_datagram(&datagram));
        }
        Ok(outcomes)
    }

    /// Handle one datagram
    pub fn handle_datagram(&mut self, datagram: &[u8]) -> InboundOutcome {
        self.stats.received += 1;
        let outcome = self.dispatch(datagram);
        match &outcome {
            InboundOutcome::Applied { .. } => self.stats.applied += 1,
            InboundOutcome::Forwarded(_) => self.stats.forwarded += 1,
            InboundOutcome::Dropped(_) => self.stats.dropped += 1,
        }
        outcome
    }

    fn dispatch(&mut self, datagram: &[u8]) -> InboundOutcome {
        let packet = match CoapPacket::parse(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping datagram: {}", e);
                return InboundOutcome::Dropped(DropReason::Malformed);
            }
        };
        if packet.token.as_slice() != self.token {
            debug!("Dropping datagram with foreign token {:02x?}", packet.token);
            return InboundOutcome::Dropped(DropReason::TokenMismatch);
        }
        if packet.payload.is_empty() {
            return InboundOutcome::Dropped(DropReason::Empty);
        }

        let message = match decode(&packet.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping notification payload: {}", e);
                return InboundOutcome::Dropped(DropReason::Invalid(e));
            }
        };

        match message {
            Message::ControlUpdate(update) => {
                let result = lock_engine(&self.engine).apply_control_update(&update);
                self.applied(update.group, result)
            }
            Message::ThresholdUpdate(update) => {
                let result = lock_engine(&self.engine).apply_threshold_update(&update);
                self.applied(update.group, result)
            }
            other if other.message_type().link() == LinkKind::Internal => {
                let msg_type = other.message_type();
                let frame = packet.payload[..msg_type.frame_len()].to_vec();
                match self.forward.as_mut() {
                    Some(forward) => {
                        debug!("Forwarding {} to the internal link", msg_type);
                        forward(frame);
                        InboundOutcome::Forwarded(msg_type)
                    }
                    None => InboundOutcome::Dropped(DropReason::Unexpected(msg_type)),
                }
            }
            other => InboundOutcome::Dropped(DropReason::Unexpected(other.message_type())),
        }
    }

    fn applied(&self, group: u8, result: Result<()>) -> InboundOutcome {
        match result {
            Ok(()) => {
                info!("User update applied to group {}", group);
                InboundOutcome::Applied { group }
            }
            Err(_) => InboundOutcome::Dropped(DropReason::Rejected { group }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coap::{CoapCode, CoapType};
    use crate::control::{ControlEngine, ControlEvent, ControlMode};
    use crate::session::MemoryTransport;
    use crate::storage::{MemoryStore, PersistQueue};
    use agrinet::{encode, ActuatorCommand, ActuatorState, ControlUpdate, ThresholdUpdate};
    use std::sync::{Arc, Mutex};

    fn notification(token: &[u8], payload: Vec<u8>) -> Vec<u8> {
        CoapPacket {
            kind: CoapType::NonConfirmable,
            code: CoapCode::CONTENT,
            message_id: 42,
            token: token.to_vec(),
            options: vec![],
            payload,
        }
        .to_bytes()
    }

    fn setup() -> (InboundDispatcher, SharedEngine, PersistQueue) {
        let store = MemoryStore::new();
        let queue = PersistQueue::spawn(Arc::new(store.clone())).unwrap();
        let mut engine = ControlEngine::new(Arc::new(store), queue.handle());
        engine.step(ControlEvent::Boot);
        let engine = engine.into_shared();
        (
            InboundDispatcher::new(Arc::clone(&engine), 0x9889),
            engine,
            queue,
        )
    }

    fn manual(group: u8) -> Vec<u8> {
        encode(&Message::ControlUpdate(ControlUpdate {
            group,
            automatic: false,
            switches: ActuatorState {
                fan: true,
                water: false,
                light: true,
            },
        }))
    }

    #[test]
    fn test_control_update_applied() {
        let (mut inbound, engine, _queue) = setup();
        let outcome = inbound.handle_datagram(&notification(&[0x89, 0x98], manual(3)));
        assert_eq!(outcome, InboundOutcome::Applied { group: 3 });
        assert_eq!(
            lock_engine(&engine).config(3).unwrap().mode,
            ControlMode::Manual {
                fan: true,
                water: false,
                light: true
            }
        );
    }

    #[test]
    fn test_token_mismatch_leaves_engine_unchanged() {
        let (mut inbound, engine, _queue) = setup();
        let before: Vec<_> = (1..=5).map(|g| lock_engine(&engine).config(g)).collect();

        let tokens: [&[u8]; 4] = [&[0x98, 0x89], &[0x89], &[0x89, 0x98, 0x00], &[]];
        for token in tokens {
            let outcome = inbound.handle_datagram(&notification(token, manual(1)));
            assert_eq!(outcome, InboundOutcome::Dropped(DropReason::TokenMismatch));
        }

        let after: Vec<_> = (1..=5).map(|g| lock_engine(&engine).config(g)).collect();
        assert_eq!(before, after);
        assert_eq!(inbound.stats().dropped, 4);
    }

    #[test]
    fn test_corrupt_payload_dropped() {
        let (mut inbound, _engine, _queue) = setup();
        let mut payload = encode(&Message::ThresholdUpdate(ThresholdUpdate {
            group: 1,
            temperature: 2600,
            humidity: 6500,
            light: 90,
            soil_moisture: 5000,
        }));
        payload[4] ^= 0x10;
        let outcome = inbound.handle_datagram(&notification(&[0x89, 0x98], payload));
        assert!(matches!(
            outcome,
            InboundOutcome::Dropped(DropReason::Invalid(DecodeError::CrcMismatch { .. }))
        ));
    }

    #[test]
    fn test_out_of_range_group_rejected() {
        let (mut inbound, _engine, _queue) = setup();
        let outcome = inbound.handle_datagram(&notification(&[0x89, 0x98], manual(7)));
        assert_eq!(
            outcome,
            InboundOutcome::Dropped(DropReason::Rejected { group: 7 })
        );
    }

    #[test]
    fn test_internal_frame_forwarded_unmodified() {
        let (inbound, _engine, _queue) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut inbound = inbound.with_forwarder(move |frame| {
            sink.lock().unwrap().push(frame);
        });

        let frame = encode(&Message::ActuatorCommand(ActuatorCommand::default()));
        let outcome = inbound.handle_datagram(&notification(&[0x89, 0x98], frame.clone()));
        assert_eq!(outcome, InboundOutcome::Forwarded(MessageType::ActuatorCommand));
        assert_eq!(*seen.lock().unwrap(), vec![frame]);
    }

    #[test]
    fn test_poll_drains_transport() {
        let (mut inbound, _engine, _queue) = setup();
        let transport = MemoryTransport::new();
        transport.push_inbound(vec![0x00]);
        transport.push_inbound(notification(&[0x89, 0x98], manual(2)));
        transport.push_inbound(notification(&[0x89, 0x98], vec![]));

        let outcomes = inbound.poll(&transport).unwrap();
        assert_eq!(
            outcomes,
            vec![
                InboundOutcome::Dropped(DropReason::Malformed),
                InboundOutcome::Applied { group: 2 },
                InboundOutcome::Dropped(DropReason::Empty),
            ]
        );
        assert!(inbound.poll(&transport).unwrap().is_empty());
    }
}
