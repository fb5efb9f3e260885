// AgriNet Coordinator - Cross-link orchestration layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Measurement cycle state machine
//!
//! ```text
//!  Dormant ──PeerConnected──▶ Sleep ──TimerFired──▶ TakeMeasurements
//!                               ▲                        │ readings > 0
//!                               │                        ▼
//!            SendToRelay ◀── EnvironmentControl ◀── CalculateMeans
//!        (every K cycles)
//! ```
//!
//! The machine is pure: [`MeasurementCycle::step`] returns the effects the
//! driver must execute, and the driver reports their completion as events.

use log::{debug, info, warn};

/// State of the measurement cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    /// No peer has connected yet
    Dormant,
    /// Polling every connected peer
    TakeMeasurements,
    /// Recomputing group aggregates
    CalculateMeans,
    /// Handing aggregates to the control engine
    EnvironmentControl,
    /// Sending the relay batch over the internal link
    SendToRelay,
    /// Waiting for the periodic timer
    Sleep,
}

/// Input of the measurement cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleEvent {
    /// A peer finished discovery
    PeerConnected,
    /// The measurement timer expired
    TimerFired {
        /// Whether at least one peer can be polled
        any_connected: bool,
    },
    /// Every connected peer was polled
    PollFinished {
        /// Number of peers that answered
        readings: usize,
    },
    /// Aggregates were recomputed
    MeansComputed,
    /// The control engine was signalled
    ControlNotified,
    /// The relay batch was sent
    RelaySent,
}

/// Work requested from the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleEffect {
    /// Poll every connected peer, then report `PollFinished`
    PollPeers,
    /// Recompute aggregates, then report `MeansComputed`
    RecomputeAggregates,
    /// Push aggregates and signal the engine, then report `ControlNotified`
    PushToControl,
    /// Send the relay batch, then report `RelaySent`
    SendRelayBatch,
    /// Zero every aggregate
    ResetAggregates,
    /// Tell the engine the aggregates were reset
    NotifyControlReset,
}

/// Measurement cycle state machine
#[derive(Debug, Clone)]
pub struct MeasurementCycle {
    state: CycleState,
    relay_every: u32,
    counter: u32,
    reset_pending: bool,
    cycles: u64,
}

impl MeasurementCycle {
    /// Machine relaying once every `relay_every` cycles with readings
    ///
    /// The counter is primed so the first such cycle relays.
    pub fn new(relay_every: u32) -> Self {
        let relay_every = relay_every.max(1);
        Self {
            state: CycleState::Dormant,
            relay_every,
            counter: relay_every,
            reset_pending: false,
            cycles: 0,
        }
    }

    /// Current state
    pub fn state(&self) -> CycleState {
        self.state
    }

    /// Cycles that produced readings
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Whether aggregates will be reset once every peer is gone
    pub fn reset_pending(&self) -> bool {
        self.reset_pending
    }

    /// Apply one event
    pub fn step(&mut self, event: CycleEvent) -> Vec<CycleEffect> {
        let (next, effects) = match (self.state, event) {
            (CycleState::Dormant, CycleEvent::PeerConnected) => {
                info!("First peer connected, measurement cycle started");
                (CycleState::Sleep, vec![])
            }
            (CycleState::Dormant, _) => (CycleState::Dormant, vec![]),
            (state, CycleEvent::PeerConnected) => (state, vec![]),

            (CycleState::Sleep, CycleEvent::TimerFired { any_connected: true }) => {
                (CycleState::TakeMeasurements, vec![CycleEffect::PollPeers])
            }
            (CycleState::Sleep, CycleEvent::TimerFired { any_connected: false }) => {
                if std::mem::take(&mut self.reset_pending) {
                    info!("No peer connected, resetting aggregates");
                    (
                        CycleState::Sleep,
                        vec![CycleEffect::ResetAggregates, CycleEffect::NotifyControlReset],
                    )
                } else {
                    (CycleState::Sleep, vec![])
                }
            }

            (CycleState::TakeMeasurements, CycleEvent::PollFinished { readings: 0 }) => {
                debug!("No readings this cycle");
                (CycleState::Sleep, vec![])
            }
            (CycleState::TakeMeasurements, CycleEvent::PollFinished { readings }) => {
                debug!("{} reading(s) taken", readings);
                self.reset_pending = true;
                self.cycles += 1;
                (
                    CycleState::CalculateMeans,
                    vec![CycleEffect::RecomputeAggregates],
                )
            }

            (CycleState::CalculateMeans, CycleEvent::MeansComputed) => (
                CycleState::EnvironmentControl,
                vec![CycleEffect::PushToControl],
            ),

            (CycleState::EnvironmentControl, CycleEvent::ControlNotified) => {
                self.counter = self.counter.saturating_add(1);
                if self.counter >= self.relay_every {
                    self.counter = 0;
                    (CycleState::SendToRelay, vec![CycleEffect::SendRelayBatch])
                } else {
                    (CycleState::Sleep, vec![])
                }
            }

            (CycleState::SendToRelay, CycleEvent::RelaySent) => (CycleState::Sleep, vec![]),

            (state, event) => {
                warn!("Measurement cycle ignored {:?} in {:?}", event, state);
                (state, vec![])
            }
        };

        if next != self.state {
            debug!("Measurement cycle {:?} -> {:?}", self.state, next);
        }
        self.state = next;
        effects
    }
}
