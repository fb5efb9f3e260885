// AgriNet Coordinator - Cross-link orchestration layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Wide-area session state machine
//!
//! ```text
//!  Init ──opened──▶ SendMeasurements ──▶ SendDeviceInfo ──▶ WaitForEvent
//!   ▲                      ▲                                    │
//!   │ transport down       └──────────── data ready ────────────┤
//!   └───────────────────────────────────────────────────────────┘
//! ```
//!
//! [`transition`] is the pure machine. [`SessionDriver`] executes its
//! effects against a [`WanTransport`] and the relay inventory.

use crate::clock::Clock;
use crate::coap::CoapPacket;
use crate::config::SessionConfig;
use crate::error::{CoordinatorError, Result};
use crate::relay::{lock_inventory, SharedInventory};
use agrinet::{encode, CloudAggregate, Message};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// Datagram transport toward the cloud collector
pub trait WanTransport: Send + Sync {
    /// Whether the underlying network is up
    fn is_connected(&self) -> bool;

    /// Open the session to the collector
    fn open(&self) -> Result<()>;

    /// Send one datagram
    fn send(&self, datagram: &[u8]) -> Result<()>;

    /// Receive one datagram without blocking
    fn try_recv(&self) -> Result<Option<Vec<u8>>>;
}

#[derive(Debug)]
struct MemoryTransportState {
    connected: bool,
    fail_open: bool,
    opened: u32,
    sent: Vec<Vec<u8>>,
    inbound: VecDeque<Vec<u8>>,
}

/// In-memory transport; clones share state
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryTransportState>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Connected transport with nothing queued
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryTransportState {
                connected: true,
                fail_open: false,
                opened: 0,
                sent: Vec::new(),
                inbound: VecDeque::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryTransportState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bring the network up or down
    pub fn set_connected(&self, connected: bool) {
        self.lock().connected = connected;
    }

    /// Make `open` fail
    pub fn fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    /// Number of successful `open` calls
    pub fn opened(&self) -> u32 {
        self.lock().opened
    }

    /// Take every datagram sent so far
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.lock().sent)
    }

    /// Queue a datagram for `try_recv`
    pub fn push_inbound(&self, datagram: Vec<u8>) {
        self.lock().inbound.push_back(datagram);
    }
}

impl WanTransport for MemoryTransport {
    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn open(&self) -> Result<()> {
        let mut state = self.lock();
        if state.fail_open || !state.connected {
            return Err(CoordinatorError::Transport("session refused".to_string()));
        }
        state.opened += 1;
        Ok(())
    }

    fn send(&self, datagram: &[u8]) -> Result<()> {
        let mut state = self.lock();
        if !state.connected {
            return Err(CoordinatorError::Transport("network down".to_string()));
        }
        state.sent.push(datagram.to_vec());
        Ok(())
    }

    fn try_recv(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.lock().inbound.pop_front())
    }
}

/// State of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the transport and opening the session
    Init,
    /// Publishing staged group aggregates
    SendMeasurements,
    /// Publishing staged device information
    SendDeviceInfo,
    /// Parked until the relay reports data ready
    WaitForEvent,
}

/// Input of the session machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionInput {
    /// Transport is not connected
    TransportDown,
    /// Transport is connected
    TransportUp,
    /// Session opened
    Opened,
    /// Session could not be opened
    OpenFailed,
    /// The current publish step finished
    Published,
    /// The relay staged a full batch
    DataReady {
        /// Transport state at wake-up
        connected: bool,
    },
    /// The observe registration is due for renewal
    RenewDue,
}

/// Work requested from the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEffect {
    /// Wait the init backoff before retrying
    Backoff,
    /// Open the session, then report `Opened` or `OpenFailed`
    OpenSession,
    /// Send the observe registration
    RegisterObserve,
    /// Schedule the next observe renewal
    ArmRenewal,
    /// Send one record per staged registered group, then report `Published`
    PublishAggregates,
    /// Drop staged aggregates
    ClearAggregates,
    /// Publish device information, then report `Published`
    PublishDeviceInfo,
    /// Drop staged device samples
    ClearDevices,
    /// Refresh the local clock
    UpdateClock,
}

/// Pure transition function of the session machine
pub fn transition(state: SessionState, input: SessionInput) -> (SessionState, Vec<SessionEffect>) {
    use SessionEffect::*;
    use SessionState::*;

    match (state, input) {
        (Init, SessionInput::TransportDown) | (Init, SessionInput::OpenFailed) => {
            (Init, vec![Backoff])
        }
        (Init, SessionInput::TransportUp) => (Init, vec![OpenSession]),
        (Init, SessionInput::Opened) => (
            SendMeasurements,
            vec![RegisterObserve, ArmRenewal, PublishAggregates],
        ),
        (SendMeasurements, SessionInput::Published) => {
            (SendDeviceInfo, vec![ClearAggregates, PublishDeviceInfo])
        }
        (SendDeviceInfo, SessionInput::Published) => (WaitForEvent, vec![ClearDevices]),
        (WaitForEvent, SessionInput::DataReady { connected: false }) => (Init, vec![]),
        (WaitForEvent, SessionInput::DataReady { connected: true }) => {
            (SendMeasurements, vec![UpdateClock, PublishAggregates])
        }
        (Init, SessionInput::RenewDue) => (Init, vec![]),
        (state, SessionInput::RenewDue) => (state, vec![RegisterObserve, ArmRenewal]),
        (state, _) => (state, vec![]),
    }
}

/// Session counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Aggregate records sent
    pub published: u64,
    /// Observe registrations sent
    pub observe_registrations: u64,
    /// Datagrams the transport refused
    pub send_failures: u64,
    /// Sessions opened
    pub sessions_opened: u64,
}

/// Executes the session machine
pub struct SessionDriver<T: WanTransport> {
    transport: Arc<T>,
    config: SessionConfig,
    inventory: SharedInventory,
    clock: Arc<dyn Clock>,
    state: SessionState,
    renew_at_ms: Option<i64>,
    local_clock_ms: i64,
    message_id: u16,
    put_token: u32,
    stats: SessionStats,
}

impl<T: WanTransport> SessionDriver<T> {
    /// Driver publishing the aggregates staged in `inventory`
    pub fn new(
        transport: Arc<T>,
        config: SessionConfig,
        inventory: SharedInventory,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let local_clock_ms = clock.now_ms();
        Self {
            transport,
            config,
            inventory,
            clock,
            state: SessionState::Init,
            renew_at_ms: None,
            local_clock_ms,
            message_id: rand::random(),
            put_token: rand::random(),
            stats: SessionStats::default(),
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Counters
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Observe correlation token as sent on the wire
    pub fn observe_token(&self) -> [u8; 2] {
        self.config.observe_token.to_le_bytes()
    }

    /// Run `Init`: check the transport, open the session and flush staged data
    ///
    /// Fails with a transport error when the caller should wait the init
    /// backoff and retry. Does nothing outside `Init`.
    pub fn start(&mut self) -> Result<usize> {
        if self.state != SessionState::Init {
            return Ok(0);
        }
        let input = if self.transport.is_connected() {
            SessionInput::TransportUp
        } else {
            SessionInput::TransportDown
        };
        self.drive(input)
    }

    /// Handle a data-ready wake-up; returns the number of records published
    pub fn on_data_ready(&mut self) -> Result<usize> {
        if self.state == SessionState::Init {
            return self.start();
        }
        let connected = self.transport.is_connected();
        let published = self.drive(SessionInput::DataReady { connected })?;
        if !connected {
            warn!("Transport down on data ready, session back to Init");
            return self.start();
        }
        Ok(published)
    }

    /// Renew the observe registration when due; returns whether it was sent
    pub fn renew_if_due(&mut self) -> Result<bool> {
        match self.renew_at_ms {
            Some(at) if self.state != SessionState::Init && self.clock.now_ms() >= at => {
                self.drive(SessionInput::RenewDue)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn drive(&mut self, input: SessionInput) -> Result<usize> {
        let mut pending = VecDeque::from([input]);
        let mut published = 0;

        while let Some(input) = pending.pop_front() {
            let (next, effects) = transition(self.state, input);
            if next != self.state {
                debug!("Session {:?} -> {:?}", self.state, next);
            }
            self.state = next;

            for effect in effects {
                match effect {
                    SessionEffect::Backoff => {
                        return Err(CoordinatorError::Transport(format!(
                            "collector {} unavailable",
                            self.config.server
                        )));
                    }
                    SessionEffect::OpenSession => match self.transport.open() {
                        Ok(()) => {
                            self.stats.sessions_opened += 1;
                            info!("Session to {} opened", self.config.server);
                            pending.push_back(SessionInput::Opened);
                        }
                        Err(e) => {
                            warn!("Opening session failed: {}", e);
                            pending.push_back(SessionInput::OpenFailed);
                        }
                    },
                    SessionEffect::RegisterObserve => self.register_observe(),
                    SessionEffect::ArmRenewal => {
                        let renew = self.config.observe_renew().as_millis() as i64;
                        self.renew_at_ms = Some(self.clock.now_ms() + renew);
                    }
                    SessionEffect::PublishAggregates => {
                        published += self.publish_aggregates();
                        pending.push_back(SessionInput::Published);
                    }
                    SessionEffect::ClearAggregates => {
                        lock_inventory(&self.inventory).clear_aggregates();
                    }
                    SessionEffect::PublishDeviceInfo => {
                        let devices = lock_inventory(&self.inventory).devices().len();
                        debug!("{} device record(s) staged, not published", devices);
                        pending.push_back(SessionInput::Published);
                    }
                    SessionEffect::ClearDevices => {
                        lock_inventory(&self.inventory).clear_devices();
                    }
                    SessionEffect::UpdateClock => {
                        self.local_clock_ms = self.clock.now_ms();
                    }
                }
            }
        }

        Ok(published)
    }

    fn register_observe(&mut self) {
        let message_id = self.next_message_id();
        let packet = CoapPacket::observe_request(
            &self.config.observe_resource,
            &self.observe_token(),
            message_id,
        );
        match self.transport.send(&packet.to_bytes()) {
            Ok(()) => {
                self.stats.observe_registrations += 1;
                debug!("Observe registered on {}", self.config.observe_resource);
            }
            Err(e) => {
                self.stats.send_failures += 1;
                warn!("Observe registration failed: {}", e);
            }
        }
    }

    fn publish_aggregates(&mut self) -> usize {
        let aggregates = lock_inventory(&self.inventory).registered_aggregates();
        let mut sent = 0;
        for aggregate in &aggregates {
            let record = CloudAggregate::from_aggregate(aggregate, self.local_clock_ms);
            let token = self.next_put_token();
            let message_id = self.next_message_id();
            let packet = CoapPacket::put_request(
                &self.config.data_resource,
                &token,
                message_id,
                encode(&Message::CloudAggregate(record)),
            );
            match self.transport.send(&packet.to_bytes()) {
                Ok(()) => sent += 1,
                Err(e) => {
                    self.stats.send_failures += 1;
                    warn!("Record for group {} not sent: {}", aggregate.group, e);
                }
            }
        }
        self.stats.published += sent as u64;
        if sent > 0 {
            info!("Published {} group record(s)", sent);
        }
        sent
    }

    fn next_message_id(&mut self) -> u16 {
        self.message_id = self.message_id.wrapping_add(1);
        self.message_id
    }

    fn next_put_token(&mut self) -> [u8; 4] {
        self.put_token = self.put_token.wrapping_add(1);
        self.put_token.to_be_bytes()
    }
}
