// AgriNet Coordinator - Cross-link orchestration layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Coordinator driver
//!
//! Executes the effects of the measurement cycle against the link manager,
//! the aggregate store, the control engine and the internal link.

use crate::clock::Clock;
use crate::config::CoordinatorConfig;
use crate::control::{lock_engine, ControlEvent, SharedEngine};
use crate::error::Result;
use crate::inventory::AggregateStore;
use crate::link::{LinkManager, LinkNotice, LinkState, PeerRadio};
use crate::measurement::{CycleEffect, CycleEvent, CycleState, MeasurementCycle};
use agrinet::{
    AckedSender, ActuatorCommand, Channel, GroupAggregate, Message, RawSample, MAX_GROUPS,
};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// Internal link shared by the measurement cycle and the control path
pub type SharedRelayLink<C> = Arc<Mutex<AckedSender<C>>>;

fn lock_link<C: Channel>(link: &SharedRelayLink<C>) -> MutexGuard<'_, AckedSender<C>> {
    link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Ordered messages of one relay flush
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayBatch {
    messages: Vec<Message>,
}

impl RelayBatch {
    /// Clock sync, one record per live sample, one per registered group,
    /// then the ready sentinel
    pub fn build(samples: &[RawSample], aggregates: &[GroupAggregate]) -> Self {
        let mut messages = Vec::with_capacity(samples.len() + aggregates.len() + 2);
        messages.push(Message::TimestampSync);
        messages.extend(samples.iter().map(|s| Message::RawSample(*s)));
        messages.extend(
            aggregates
                .iter()
                .filter(|a| a.registered)
                .map(|a| Message::GroupAggregate(*a)),
        );
        messages.push(Message::ReadyToRelay);
        Self { messages }
    }

    /// Messages in send order
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Never true; a batch always carries the sync and the sentinel
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Runs the control engine and ships its commands to the relay
pub struct ControlHandle<C: Channel> {
    engine: SharedEngine,
    relay: SharedRelayLink<C>,
}

impl<C: Channel> Clone for ControlHandle<C> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            relay: Arc::clone(&self.relay),
        }
    }
}

impl<C: Channel> ControlHandle<C> {
    /// Handle over `engine` sending through `relay`
    pub fn new(engine: SharedEngine, relay: SharedRelayLink<C>) -> Self {
        Self { engine, relay }
    }

    /// Feed an event; a resulting command is sent to the relay
    pub fn handle(&self, event: ControlEvent) -> Result<Option<ActuatorCommand>> {
        let command = lock_engine(&self.engine).step(event);
        if let Some(command) = command {
            let inbound = lock_link(&self.relay).send(&Message::ActuatorCommand(command))?;
            log_inbound(&inbound);
        }
        Ok(command)
    }

    /// Shared engine
    pub fn engine(&self) -> &SharedEngine {
        &self.engine
    }
}

fn log_inbound(messages: &[Message]) {
    for message in messages {
        debug!("Relay sent {} on the internal link", message.message_type());
    }
}

/// What one timer tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Peers that answered
    pub readings: usize,
    /// Peers that timed out and were released
    pub timeouts: usize,
    /// Messages sent in the relay batch
    pub relayed: usize,
    /// Frames the relay failed to take
    pub send_errors: usize,
    /// Aggregates were reset
    pub reset: bool,
    /// Command issued by the control engine
    pub command: Option<ActuatorCommand>,
}

/// Coordinator-side orchestration
pub struct Coordinator<R: PeerRadio, C: Channel> {
    link: LinkManager<R>,
    store: AggregateStore,
    cycle: MeasurementCycle,
    control: ControlHandle<C>,
    relay: SharedRelayLink<C>,
    clock: Arc<dyn Clock>,
}

impl<R: PeerRadio, C: Channel> Coordinator<R, C> {
    /// Coordinator over `radio` and the internal link `channel`
    pub fn new(
        radio: R,
        channel: C,
        engine: SharedEngine,
        clock: Arc<dyn Clock>,
        config: &CoordinatorConfig,
    ) -> Self {
        let relay = Arc::new(Mutex::new(AckedSender::with_timeout(
            channel,
            config.ack_timeout(),
        )));
        Self {
            link: LinkManager::new(radio, config),
            store: AggregateStore::new(config.max_peers),
            cycle: MeasurementCycle::new(config.relay_every_cycles()),
            control: ControlHandle::new(engine, Arc::clone(&relay)),
            relay,
            clock,
        }
    }

    /// Boot the control engine and start looking for peers
    pub fn start(&mut self) -> Result<Option<ActuatorCommand>> {
        let command = self.control.handle(ControlEvent::Boot)?;
        if let Some(command) = command {
            self.store.set_all_actuators(command.groups);
        }
        self.link.start_scan();
        Ok(command)
    }

    /// Apply pending radio events; returns the number of peers that became ready
    pub fn process_link_events(&mut self) -> usize {
        let mut ready = 0;
        loop {
            let mut progressed = false;
            for notice in self.link.process_events() {
                if let LinkNotice::PeerReady { .. } = notice {
                    ready += 1;
                    progressed = true;
                    self.cycle.step(CycleEvent::PeerConnected);
                }
            }
            // Scanning resumes after any release; a failing peer is retried on
            // the next call rather than in this loop
            self.link.take_slot_freed();
            if self.link.state() == LinkState::Idle && self.link.start_scan().is_none() {
                break;
            }
            if !progressed {
                break;
            }
        }
        ready
    }

    /// Handle one measurement timer expiry
    pub fn on_timer(&mut self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let any_connected = self.link.any_connected();
        let mut effects: VecDeque<CycleEffect> = self
            .cycle
            .step(CycleEvent::TimerFired { any_connected })
            .into();

        while let Some(effect) = effects.pop_front() {
            let follow_up = match effect {
                CycleEffect::PollPeers => {
                    self.poll_all(&mut report);
                    Some(CycleEvent::PollFinished {
                        readings: report.readings,
                    })
                }
                CycleEffect::RecomputeAggregates => {
                    self.store.recompute();
                    Some(CycleEvent::MeansComputed)
                }
                CycleEffect::PushToControl => {
                    report.command = self.push_to_control()?;
                    Some(CycleEvent::ControlNotified)
                }
                CycleEffect::SendRelayBatch => {
                    self.send_relay_batch(&mut report);
                    Some(CycleEvent::RelaySent)
                }
                CycleEffect::ResetAggregates => {
                    self.store.reset_all();
                    report.reset = true;
                    None
                }
                CycleEffect::NotifyControlReset => {
                    report.command = self.push_to_control()?;
                    None
                }
            };
            if let Some(event) = follow_up {
                effects.extend(self.cycle.step(event));
            }
        }

        // Peers released by failed polls leave room for new ones
        self.process_link_events();
        Ok(report)
    }

    /// Relay batch for the current sweep
    pub fn relay_batch(&self) -> RelayBatch {
        RelayBatch::build(&self.store.live_samples(), &self.store.aggregates())
    }

    /// Feed a frame received from the relay outside of a send
    pub fn on_relay_frame(&self, frame: &[u8]) -> Option<Message> {
        lock_link(&self.relay).on_frame(frame)
    }

    /// Control path shared with the inbound loop
    pub fn control_handle(&self) -> ControlHandle<C> {
        self.control.clone()
    }

    /// Internal link
    pub fn relay_link(&self) -> SharedRelayLink<C> {
        Arc::clone(&self.relay)
    }

    /// Link manager
    pub fn link(&self) -> &LinkManager<R> {
        &self.link
    }

    /// Link manager, mutably
    pub fn link_mut(&mut self) -> &mut LinkManager<R> {
        &mut self.link
    }

    /// Current group aggregates
    pub fn aggregates(&self) -> [GroupAggregate; MAX_GROUPS] {
        self.store.aggregates()
    }

    /// Measurement cycle state
    pub fn cycle_state(&self) -> CycleState {
        self.cycle.state()
    }

    fn poll_all(&mut self, report: &mut CycleReport) {
        self.store.begin_sweep();
        for slot in self.link.connected_slots() {
            let Some(address) = self.link.peer(slot).map(|p| p.address) else {
                continue;
            };
            match self.link.poll_peer(slot) {
                Ok(set) => match self.store.record(slot, set.into_raw(address)) {
                    Ok(()) => report.readings += 1,
                    Err(e) => warn!("Sample of {} not stored: {}", address, e),
                },
                Err(e) => {
                    debug!("Poll of {} failed: {}", address, e);
                    self.store.abandon(slot);
                    report.timeouts += 1;
                }
            }
        }
        debug!(
            "Sweep at {}: {} reading(s), {} timeout(s)",
            self.clock.now_ms(),
            report.readings,
            report.timeouts
        );
    }

    fn push_to_control(&mut self) -> Result<Option<ActuatorCommand>> {
        lock_engine(self.control.engine()).update_measurements(&self.store.aggregates());
        let command = self.control.handle(ControlEvent::MeasurementsTaken)?;
        if let Some(command) = command {
            self.store.set_all_actuators(command.groups);
        }
        Ok(command)
    }

    fn send_relay_batch(&mut self, report: &mut CycleReport) {
        let batch = self.relay_batch();
        let mut link = lock_link(&self.relay);
        for message in batch.messages() {
            match link.send(message) {
                Ok(inbound) => {
                    report.relayed += 1;
                    log_inbound(&inbound);
                }
                Err(e) => {
                    report.send_errors += 1;
                    warn!("Relay refused {}: {}", message.message_type(), e);
                }
            }
        }
        info!(
            "Relay batch sent: {} of {} message(s)",
            report.relayed,
            batch.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::control::ControlEngine;
    use crate::sim::{SimPeer, SimulatedRadio};
    use crate::storage::{MemoryStore, PersistQueue};
    use agrinet::{decode, MemoryChannel, MessageType, ResultCode};

    fn coordinator(
        radio: SimulatedRadio,
        config: &CoordinatorConfig,
    ) -> (Coordinator<SimulatedRadio, MemoryChannel>, PersistQueue) {
        let store = MemoryStore::new();
        let queue = PersistQueue::spawn(Arc::new(store.clone())).unwrap();
        let engine = ControlEngine::new(Arc::new(store), queue.handle()).into_shared();
        let coordinator = Coordinator::new(
            radio,
            MemoryChannel::new(),
            engine,
            Arc::new(ManualClock::new(0)),
            config,
        );
        (coordinator, queue)
    }

    fn quick_config() -> CoordinatorConfig {
        CoordinatorConfig {
            ack_timeout_ms: 1,
            ..CoordinatorConfig::relay_every_sweep()
        }
    }

    fn sent_types(coordinator: &Coordinator<SimulatedRadio, MemoryChannel>) -> Vec<MessageType> {
        let link = coordinator.relay_link();
        let mut link = lock_link(&link);
        link.channel_mut()
            .drain_outgoing()
            .iter()
            .map(|f| decode(f).unwrap().message_type())
            .collect()
    }

    #[test]
    fn test_batch_order() {
        let mut aggregates = [GroupAggregate::default(); 3];
        aggregates[0] = GroupAggregate {
            group: 1,
            registered: true,
            ..Default::default()
        };
        aggregates[1] = GroupAggregate::unregistered(2);
        let batch = RelayBatch::build(&[RawSample::default()], &aggregates);
        let types: Vec<_> = batch.messages().iter().map(|m| m.message_type()).collect();
        assert_eq!(
            types,
            vec![
                MessageType::TimestampSync,
                MessageType::RawSample,
                MessageType::GroupAggregate,
                MessageType::ReadyToRelay
            ]
        );
        assert!(!batch.is_empty());
    }

    #[test]
    fn test_connects_whole_field() {
        let (mut coordinator, _queue) = coordinator(SimulatedRadio::with_field(4, 2), &quick_config());
        coordinator.start().unwrap();
        assert_eq!(coordinator.process_link_events(), 4);
        assert_eq!(coordinator.link().occupied(), 4);
        assert_eq!(coordinator.cycle_state(), CycleState::Sleep);
    }

    #[test]
    fn test_dormant_tick_does_nothing() {
        let (mut coordinator, _queue) = coordinator(SimulatedRadio::new(), &quick_config());
        coordinator.start().unwrap();
        sent_types(&coordinator);

        let report = coordinator.on_timer().unwrap();
        assert_eq!(report, CycleReport::default());
        assert!(sent_types(&coordinator).is_empty());
    }

    #[test]
    fn test_tick_sends_command_and_batch() {
        let mut radio = SimulatedRadio::new();
        radio.add_peer(SimPeer::new(1, 1).with_readings(3000, 5000, 5000, 100));
        let (mut coordinator, _queue) = coordinator(radio, &quick_config());
        coordinator.start().unwrap();
        coordinator.process_link_events();
        assert_eq!(sent_types(&coordinator), vec![MessageType::ActuatorCommand]);

        let report = coordinator.on_timer().unwrap();
        assert_eq!(report.readings, 1);
        assert_eq!(report.relayed, 4);
        let command = report.command.unwrap();
        assert!(command.groups[0].fan);
        assert!(command.groups[0].water);
        assert_eq!(coordinator.aggregates()[0].actuators, command.groups[0]);

        assert_eq!(
            sent_types(&coordinator),
            vec![
                MessageType::ActuatorCommand,
                MessageType::TimestampSync,
                MessageType::RawSample,
                MessageType::GroupAggregate,
                MessageType::ReadyToRelay
            ]
        );
    }

    #[test]
    fn test_lost_peer_resets_once() {
        let mut radio = SimulatedRadio::new();
        let peer = SimPeer::new(1, 2);
        let address = peer.address;
        radio.add_peer(peer);
        let (mut coordinator, _queue) = coordinator(radio, &quick_config());
        coordinator.start().unwrap();
        coordinator.process_link_events();
        coordinator.on_timer().unwrap();
        assert!(coordinator.aggregates()[1].registered);

        coordinator.link_mut().radio_mut().drop_peer(&address);
        coordinator.process_link_events();

        let report = coordinator.on_timer().unwrap();
        assert!(report.reset);
        assert!(coordinator.aggregates().iter().all(|a| !a.registered));
        assert_eq!(report.command.unwrap().groups[1], agrinet::ActuatorState::OFF);

        assert!(!coordinator.on_timer().unwrap().reset);
    }

    #[test]
    fn test_acks_release_permit() {
        let mut radio = SimulatedRadio::new();
        radio.add_peer(SimPeer::new(1, 1));
        let (mut coordinator, _queue) = coordinator(radio, &quick_config());
        coordinator.start().unwrap();
        coordinator.process_link_events();

        let link = coordinator.relay_link();
        let ack = agrinet::encode(&Message::OperationResult(ResultCode::ACTUATORS_OK));
        assert_eq!(coordinator.on_relay_frame(&ack), None);
        assert!(!lock_link(&link).permit().is_taken());
        assert_eq!(lock_link(&link).stats().acked, 1);
    }
}
