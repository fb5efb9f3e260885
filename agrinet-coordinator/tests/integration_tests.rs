// AgriNet Coordinator - Cross-link orchestration layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Integration tests for the coordinator crate
//!
//! Covers:
//! - Full row: peers -> coordinator -> relay -> collector
//! - Peer timeouts and slot reuse
//! - User updates arriving over the wide-area session
//! - Configuration persistence across restarts
//! - Irrigation hysteresis through the whole pipeline
//! - Sweeps over a lossy internal link

use agrinet::{
    decode, ActuatorState, CloudAggregate, ControlUpdate, LossyChannel, Message, ThresholdUpdate,
};
use agrinet_coordinator::{
    lock_engine, CoapCode, CoapPacket, CoapType, ControlEngine, ControlEvent, ControlMode,
    Coordinator, CoordinatorConfig, DropReason, FileStore, InboundDispatcher, InboundOutcome,
    ManualClock, MemoryStore, MemoryTransport, OutputLog, PersistQueue, RelayEndpoint,
    RelayInventory, RelayLoopback, SessionConfig, SessionDriver, SessionState, SharedEngine,
    SharedInventory, SimPeer, SimulatedRadio,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const START_MS: i64 = 1_700_000_000_000;

struct Row {
    coordinator: Coordinator<SimulatedRadio, RelayLoopback<OutputLog>>,
    engine: SharedEngine,
    inventory: SharedInventory,
    outputs: OutputLog,
    ready: Arc<AtomicUsize>,
    store: MemoryStore,
    queue: PersistQueue,
    clock: Arc<ManualClock>,
}

fn row(radio: SimulatedRadio) -> Row {
    let clock = Arc::new(ManualClock::new(START_MS));
    let store = MemoryStore::new();
    let queue = PersistQueue::spawn(Arc::new(store.clone())).unwrap();
    let engine = ControlEngine::new(Arc::new(store.clone()), queue.handle()).into_shared();

    let inventory = RelayInventory::new(20).into_shared();
    let outputs = OutputLog::new();
    let ready = Arc::new(AtomicUsize::new(0));
    let ready_hook = Arc::clone(&ready);
    let loopback = RelayLoopback::new(RelayEndpoint::new(
        Arc::clone(&inventory),
        outputs.clone(),
        clock.clone(),
    ))
    .with_ready_hook(move || {
        ready_hook.fetch_add(1, Ordering::SeqCst);
    });

    let config = CoordinatorConfig {
        ack_timeout_ms: 1,
        ..CoordinatorConfig::relay_every_sweep()
    };
    let mut coordinator = Coordinator::new(
        radio,
        loopback,
        Arc::clone(&engine),
        clock.clone(),
        &config,
    );
    coordinator.start().unwrap();
    coordinator.process_link_events();

    Row {
        coordinator,
        engine,
        inventory,
        outputs,
        ready,
        store,
        queue,
        clock,
    }
}

/// Two peers in group 1, one in group 2
fn three_peer_field() -> SimulatedRadio {
    let mut radio = SimulatedRadio::new();
    radio.add_peer(SimPeer::new(1, 1).with_readings(2400, 6000, 5000, 200));
    radio.add_peer(SimPeer::new(2, 1).with_readings(2600, 6200, 5400, 220));
    radio.add_peer(SimPeer::new(3, 2).with_readings(2000, 5000, 7000, 100));
    radio
}

fn session(row: &Row, transport: &MemoryTransport) -> SessionDriver<MemoryTransport> {
    SessionDriver::new(
        Arc::new(transport.clone()),
        SessionConfig::default(),
        Arc::clone(&row.inventory),
        row.clock.clone(),
    )
}

fn published(transport: &MemoryTransport) -> Vec<CloudAggregate> {
    transport
        .take_sent()
        .iter()
        .map(|d| CoapPacket::parse(d).unwrap())
        .filter(|p| p.code == CoapCode::PUT)
        .map(|p| match decode(&p.payload).unwrap() {
            Message::CloudAggregate(record) => record,
            other => panic!("unexpected {:?}", other),
        })
        .collect()
}

fn user_update(token: &[u8], message: &Message) -> Vec<u8> {
    CoapPacket {
        kind: CoapType::NonConfirmable,
        code: CoapCode::CONTENT,
        message_id: 7,
        token: token.to_vec(),
        options: vec![],
        payload: agrinet::encode(message),
    }
    .to_bytes()
}

// ============================================================================
// Full row
// ============================================================================

#[test]
fn test_full_row_relays_registered_groups() {
    let mut row = row(three_peer_field());
    assert_eq!(row.coordinator.link().occupied(), 3);

    let report = row.coordinator.on_timer().unwrap();
    assert_eq!(report.readings, 3);
    assert_eq!(report.timeouts, 0);
    // sync + 3 samples + 2 aggregates + ready
    assert_eq!(report.relayed, 7);
    assert_eq!(report.send_errors, 0);
    assert_eq!(row.ready.load(Ordering::SeqCst), 1);

    let aggregates = row.coordinator.aggregates();
    assert_eq!(aggregates[0].temperature, 2500);
    assert_eq!(aggregates[0].humidity, 6100);
    assert_eq!(aggregates[0].soil_moisture, 5200);
    assert_eq!(aggregates[1].temperature, 2000);
    for aggregate in &aggregates[2..] {
        assert!(!aggregate.registered);
        assert_eq!(aggregate.temperature, 0);
        assert_eq!(aggregate.actuators, ActuatorState::OFF);
    }

    let command = row.outputs.last().unwrap();
    assert_eq!(
        command.groups[0],
        ActuatorState {
            fan: false,
            water: true,
            light: true
        }
    );
    assert_eq!(
        command.groups[1],
        ActuatorState {
            fan: false,
            water: false,
            light: true
        }
    );
    assert_eq!(command.groups[2], ActuatorState::OFF);

    {
        let inventory = row.inventory.lock().unwrap();
        assert_eq!(inventory.devices().len(), 3);
        let staged: Vec<u8> = inventory
            .registered_aggregates()
            .iter()
            .map(|a| a.group)
            .collect();
        assert_eq!(staged, vec![1, 2]);
        assert_eq!(inventory.clock_ms(), Some(START_MS));
    }

    let transport = MemoryTransport::new();
    let mut driver = session(&row, &transport);
    assert_eq!(driver.start().unwrap(), 2);
    assert_eq!(driver.state(), SessionState::WaitForEvent);

    let records = published(&transport);
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].group, 1);
    assert_eq!(records[0].temperature, 2500);
    assert_eq!(records[0].timestamp_ms, START_MS);
    assert!(records[0].actuators.water);
    assert_eq!(records[1].group, 2);
    assert_eq!(records[1].soil_moisture, 7000);

    let inventory = row.inventory.lock().unwrap();
    assert!(inventory.registered_aggregates().is_empty());
    assert!(inventory.devices().is_empty());
}

#[test]
fn test_second_sweep_publishes_on_data_ready() {
    let mut row = row(three_peer_field());
    let transport = MemoryTransport::new();
    let mut driver = session(&row, &transport);

    row.coordinator.on_timer().unwrap();
    driver.start().unwrap();
    transport.take_sent();

    row.clock.advance_ms(30_000);
    row.coordinator.on_timer().unwrap();
    assert_eq!(row.ready.load(Ordering::SeqCst), 2);

    assert_eq!(driver.on_data_ready().unwrap(), 2);
    let records = published(&transport);
    assert!(records.iter().all(|r| r.timestamp_ms == START_MS + 30_000));
    assert_eq!(driver.stats().published, 4);
    assert_eq!(driver.stats().observe_registrations, 1);
}

#[test]
fn test_unreachable_collector_keeps_staged_data() {
    let mut row = row(three_peer_field());
    row.coordinator.on_timer().unwrap();

    let transport = MemoryTransport::new();
    transport.set_connected(false);
    let mut driver = session(&row, &transport);
    assert!(driver.start().is_err());
    assert_eq!(driver.state(), SessionState::Init);
    assert_eq!(
        row.inventory.lock().unwrap().registered_aggregates().len(),
        2
    );

    transport.set_connected(true);
    assert_eq!(driver.start().unwrap(), 2);
    assert_eq!(transport.opened(), 1);
}

// ============================================================================
// Peer timeouts
// ============================================================================

#[test]
fn test_timeout_releases_slot_and_excludes_sample() {
    let mut row = row(three_peer_field());
    row.coordinator.on_timer().unwrap();
    assert_eq!(row.coordinator.link().ever_connected(), 3);

    let silent = SimPeer::new(2, 1).address;
    row.coordinator
        .link_mut()
        .radio_mut()
        .set_responsive(&silent, false);

    let report = row.coordinator.on_timer().unwrap();
    assert_eq!(report.readings, 2);
    assert_eq!(report.timeouts, 1);
    assert!(!report.reset);
    assert_eq!(row.coordinator.aggregates()[0].temperature, 2400);

    // The freed slot is offered to the next advertising peer
    assert_eq!(row.coordinator.link().ever_connected(), 4);
    assert_eq!(row.coordinator.link().occupied(), 3);
}

#[test]
fn test_whole_group_lost_turns_outputs_off() {
    let mut row = row(three_peer_field());
    row.coordinator.on_timer().unwrap();
    assert!(row.coordinator.aggregates()[1].registered);

    let lone = SimPeer::new(3, 2).address;
    row.coordinator.link_mut().radio_mut().drop_peer(&lone);
    row.coordinator.process_link_events();

    let report = row.coordinator.on_timer().unwrap();
    assert_eq!(report.readings, 2);
    assert!(!row.coordinator.aggregates()[1].registered);
    assert_eq!(row.coordinator.aggregates()[1].temperature, 0);
    assert_eq!(row.outputs.last().unwrap().groups[1], ActuatorState::OFF);
}

// ============================================================================
// User updates
// ============================================================================

#[test]
fn test_manual_override_reaches_outputs() {
    let mut row = row(three_peer_field());
    let transport = MemoryTransport::new();
    let mut inbound = InboundDispatcher::new(Arc::clone(&row.engine), 0x9889);

    transport.push_inbound(user_update(
        &[0x89, 0x98],
        &Message::ControlUpdate(ControlUpdate {
            group: 2,
            automatic: false,
            switches: ActuatorState {
                fan: true,
                water: true,
                light: false,
            },
        }),
    ));
    let outcomes = inbound.poll(&transport).unwrap();
    assert_eq!(outcomes, vec![InboundOutcome::Applied { group: 2 }]);

    let control = row.coordinator.control_handle();
    let command = control.handle(ControlEvent::UserRequest).unwrap().unwrap();
    assert_eq!(
        command.groups[1],
        ActuatorState {
            fan: true,
            water: true,
            light: false
        }
    );
    assert_eq!(row.outputs.last(), Some(command));

    row.coordinator.on_timer().unwrap();
    assert_eq!(row.coordinator.aggregates()[1].actuators, command.groups[1]);
}

#[test]
fn test_foreign_token_changes_nothing() {
    let row = row(three_peer_field());
    let transport = MemoryTransport::new();
    let mut inbound = InboundDispatcher::new(Arc::clone(&row.engine), 0x9889);
    let before: Vec<_> = (1..=5).map(|g| lock_engine(&row.engine).config(g)).collect();

    transport.push_inbound(user_update(
        &[0x12, 0x34],
        &Message::ThresholdUpdate(ThresholdUpdate {
            group: 1,
            temperature: 1000,
            humidity: 1000,
            light: 0,
            soil_moisture: 9000,
        }),
    ));
    let outcomes = inbound.poll(&transport).unwrap();
    assert_eq!(
        outcomes,
        vec![InboundOutcome::Dropped(DropReason::TokenMismatch)]
    );

    let after: Vec<_> = (1..=5).map(|g| lock_engine(&row.engine).config(g)).collect();
    assert_eq!(before, after);
}

// ============================================================================
// Persistence
// ============================================================================

#[test]
fn test_defaults_installed_once() {
    let row = row(SimulatedRadio::new());
    row.queue.handle().flush().unwrap();
    assert_eq!(row.store.len(), 5);

    // A second boot over the same store must not write anything
    row.store.fail_writes(true);
    let queue = PersistQueue::spawn(Arc::new(row.store.clone())).unwrap();
    let mut engine = ControlEngine::new(Arc::new(row.store.clone()), queue.handle());
    engine.step(ControlEvent::Boot);
    queue.handle().flush().unwrap();
    assert_eq!(queue.handle().failed_writes(), 0);

    for group in 1..=5 {
        assert_eq!(
            engine.config(group),
            lock_engine(&row.engine).config(group)
        );
    }
}

#[test]
fn test_updates_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let update = ThresholdUpdate {
        group: 3,
        temperature: 2600,
        humidity: 6500,
        light: 80,
        soil_moisture: 4500,
    };

    {
        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        let queue = PersistQueue::spawn(store.clone()).unwrap();
        let mut engine = ControlEngine::new(store, queue.handle());
        engine.step(ControlEvent::Boot);
        engine
            .apply_control_update(&ControlUpdate {
                group: 4,
                automatic: false,
                switches: ActuatorState {
                    fan: true,
                    water: false,
                    light: false,
                },
            })
            .unwrap();
        engine.apply_threshold_update(&update).unwrap();
        queue.shutdown();
    }

    let store = Arc::new(FileStore::open(dir.path()).unwrap());
    let queue = PersistQueue::spawn(store.clone()).unwrap();
    let mut engine = ControlEngine::new(store, queue.handle());
    engine.step(ControlEvent::Boot);

    let group3 = engine.config(3).unwrap();
    assert_eq!(group3.thresholds.temperature, 2600);
    assert_eq!(group3.thresholds.soil_moisture, 4500);
    assert_eq!(group3.mode, ControlMode::Automatic);
    assert_eq!(
        engine.config(4).unwrap().mode,
        ControlMode::Manual {
            fan: true,
            water: false,
            light: false
        }
    );
}

// ============================================================================
// Irrigation hysteresis
// ============================================================================

#[test]
fn test_irrigation_hysteresis_across_sweeps() {
    let mut radio = SimulatedRadio::new();
    let peer = SimPeer::new(1, 1).with_readings(2400, 6000, 5000, 200);
    let address = peer.address;
    radio.add_peer(peer);
    let mut row = row(radio);

    let water_after = |row: &mut Row, soil: i32| {
        row.coordinator
            .link_mut()
            .radio_mut()
            .set_readings(&address, 2400, 6000, soil, 200);
        row.coordinator.on_timer().unwrap();
        row.outputs.last().unwrap().groups[0].water
    };

    assert!(water_after(&mut row, 5000));
    assert!(water_after(&mut row, 6000));
    assert!(water_after(&mut row, 6600));
    assert!(!water_after(&mut row, 6660));
    assert!(!water_after(&mut row, 6000));
    assert!(water_after(&mut row, 5999));
}

// ============================================================================
// Lossy internal link
// ============================================================================

#[test]
fn test_sweeps_continue_over_lossy_relay_link() {
    let clock = Arc::new(ManualClock::new(START_MS));
    let store = MemoryStore::new();
    let queue = PersistQueue::spawn(Arc::new(store.clone())).unwrap();
    let engine = ControlEngine::new(Arc::new(store.clone()), queue.handle()).into_shared();
    let config = CoordinatorConfig {
        ack_timeout_ms: 1,
        ..CoordinatorConfig::relay_every_sweep()
    };

    // Nothing answers on this link: every frame is either lost or left unacknowledged
    let mut coordinator = Coordinator::new(
        three_peer_field(),
        LossyChannel::new(0.5),
        engine,
        clock,
        &config,
    );
    coordinator.start().unwrap();
    coordinator.process_link_events();

    for _ in 0..2 {
        let report = coordinator.on_timer().unwrap();
        assert_eq!(report.readings, 3);
        assert_eq!(report.send_errors, 0);
        assert_eq!(coordinator.aggregates()[0].temperature, 2500);
    }

    let link = coordinator.relay_link();
    let mut link = link.lock().unwrap();
    let stats = link.stats().clone();
    let metrics = link.channel_metrics();
    assert_eq!(stats.sent, metrics.frames_sent);
    assert_eq!(stats.acked, 0);
    assert_eq!(stats.timeouts, stats.sent - 1);
    assert!(metrics.frames_lost > 0 && metrics.frames_lost < metrics.frames_sent);
    assert_eq!(
        link.channel_mut().inner_mut().pending_outgoing() as u64,
        metrics.frames_sent - metrics.frames_lost
    );

    drop(link);
    queue.shutdown();
}
