// AgriNet Coordinator - Cross-link orchestration layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # AgriNet Coordinator - Cross-link orchestration layer
//!
//! State machines and drivers for the two boards of a greenhouse row
//! controller: the coordinator that polls sensor peers over a short-range
//! radio, and the relay that talks to the cloud collector.
//!
//! ## Overview
//!
//! - **Link manager**: bounded pool of peer connections, one connect in flight
//! - **Aggregation**: per-group means recomputed every sweep
//! - **Control engine**: thresholds with irrigation hysteresis, or manual switches
//! - **Measurement cycle**: poll, aggregate, control, relay every K sweeps
//! - **Session**: CoAP observe registration and aggregate publishing
//! - **Inbound dispatch**: token-checked user updates, persisted
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use agrinet::MemoryChannel;
//! use agrinet_coordinator::{
//!     ControlEngine, Coordinator, CoordinatorConfig, ManualClock, MemoryStore, PersistQueue,
//!     SimulatedRadio,
//! };
//!
//! let store = Arc::new(MemoryStore::new());
//! let queue = PersistQueue::spawn(store.clone()).unwrap();
//! let engine = ControlEngine::new(store, queue.handle()).into_shared();
//!
//! let config = CoordinatorConfig {
//!     ack_timeout_ms: 1,
//!     ..CoordinatorConfig::relay_every_sweep()
//! };
//! let mut coordinator = Coordinator::new(
//!     SimulatedRadio::with_field(3, 2),
//!     MemoryChannel::new(),
//!     engine,
//!     Arc::new(ManualClock::new(0)),
//!     &config,
//! );
//!
//! coordinator.start().unwrap();
//! coordinator.process_link_events();
//!
//! let report = coordinator.on_timer().unwrap();
//! assert_eq!(report.readings, 3);
//! ```
//!
//! ## Architecture
//!
//! ```text
//!  sensor peers ──radio──▶ Coordinator ──internal link──▶ Relay ──CoAP/UDP──▶ collector
//!                          │ LinkManager                  │ RelayEndpoint      │
//!                          │ AggregateStore               │ RelayInventory     │
//!                          │ MeasurementCycle             │ SessionDriver ◀────┘
//!                          │ ControlEngine ◀──────────────┤ InboundDispatcher
//!                          └ PersistQueue                 └ ActuatorOutputs
//! ```

pub mod clock;
pub mod coap;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod error;
pub mod inbound;
pub mod inventory;
pub mod link;
pub mod measurement;
pub mod relay;
pub mod session;
pub mod sim;
pub mod storage;

// Public API
pub use clock::{Clock, ManualClock, SystemClock};
pub use coap::{CoapCode, CoapError, CoapOption, CoapPacket, CoapType};
pub use config::{CoordinatorConfig, SessionConfig, MEASUREMENT_SERVICE_UUID};
pub use control::{
    decide, lock_engine, ControlEngine, ControlEvent, ControlMode, EngineState, GroupControl,
    SharedEngine, Thresholds,
};
pub use coordinator::{ControlHandle, Coordinator, CycleReport, RelayBatch, SharedRelayLink};
pub use error::{CoordinatorError, Result};
pub use inbound::{DropReason, InboundDispatcher, InboundOutcome, InboundStats};
pub use inventory::{recompute_aggregates, AggregateStore};
pub use link::{
    Characteristic, LinkEvent, LinkManager, LinkNotice, LinkState, PeerRadio, ReadError,
    SampleSet, SlotHandle,
};
pub use measurement::{CycleEffect, CycleEvent, CycleState, MeasurementCycle};
pub use relay::{
    ActuatorOutputs, OutputLog, RelayEndpoint, RelayInventory, RelayLoopback, RelayReply,
    SharedInventory,
};
pub use session::{
    transition, MemoryTransport, SessionDriver, SessionEffect, SessionInput, SessionState,
    SessionStats, WanTransport,
};
pub use sim::{SimPeer, SimulatedRadio};
pub use storage::{
    CalibrationPoint, ConfigStore, FileStore, MemoryStore, PersistHandle, PersistQueue, StoreKey,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
