// AgriNet Coordinator - Cross-link orchestration layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Environment control engine
//!
//! Turns group aggregates and user configuration into actuator states.
//!
//! ```text
//!  Init ──Boot──▶ Decide ──▶ WaitForEvent
//!                   ▲             │ MeasurementsTaken / UserRequest
//!                   └─────────────┘
//! ```
//!
//! Every decision covers all groups and yields one [`ActuatorCommand`].

use crate::error::{CoordinatorError, Result};
use crate::storage::{ConfigStore, PersistHandle, StoreKey, GROUP_RECORD_LEN};
use agrinet::{
    group_index, ActuatorCommand, ActuatorState, ControlUpdate, GroupAggregate, ThresholdUpdate,
    MAX_GROUPS, SOIL_SATURATED,
};
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, MutexGuard};

/// Percentage above the soil threshold at which irrigation stops
const WATER_HYSTERESIS_PERCENT: i64 = 110;

/// Automatic-mode thresholds of a group, in the units of the aggregates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Fan on above this temperature (0.01 °C)
    pub temperature: i32,
    /// Fan on above this humidity (0.01 %)
    pub humidity: i32,
    /// Light threshold
    pub light: i32,
    /// Irrigation on below this soil moisture (0.01 %)
    pub soil_moisture: i32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            temperature: 2800,
            humidity: 7000,
            light: 100,
            soil_moisture: 6000,
        }
    }
}

/// How a group's actuators are driven
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    /// Switches set by the user
    Manual {
        /// Fan switch
        fan: bool,
        /// Irrigation switch
        water: bool,
        /// Light switch
        light: bool,
    },
    /// Thresholds decide
    Automatic,
}

/// Stored configuration of one group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupControl {
    /// Automatic-mode thresholds, kept across mode switches
    pub thresholds: Thresholds,
    /// Current mode
    pub mode: ControlMode,
}

impl Default for GroupControl {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            mode: ControlMode::Automatic,
        }
    }
}

impl GroupControl {
    /// Encode as a persistent record
    ///
    /// Layout: fan, water, light, automatic (one byte each), then the
    /// temperature, humidity, light and soil thresholds as i32 LE.
    pub fn to_record(&self) -> [u8; GROUP_RECORD_LEN] {
        let mut record = [0u8; GROUP_RECORD_LEN];
        match self.mode {
            ControlMode::Manual { fan, water, light } => {
                record[0] = fan as u8;
                record[1] = water as u8;
                record[2] = light as u8;
            }
            ControlMode::Automatic => record[3] = 1,
        }
        let t = &self.thresholds;
        for (i, value) in [t.temperature, t.humidity, t.light, t.soil_moisture]
            .iter()
            .enumerate()
        {
            record[4 + i * 4..8 + i * 4].copy_from_slice(&value.to_le_bytes());
        }
        record
    }

    /// Decode a persistent record
    pub fn from_record(record: &[u8]) -> Option<Self> {
        if record.len() != GROUP_RECORD_LEN {
            return None;
        }
        let word = |i: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&record[4 + i * 4..8 + i * 4]);
            i32::from_le_bytes(bytes)
        };
        let mode = if record[3] != 0 {
            ControlMode::Automatic
        } else {
            ControlMode::Manual {
                fan: record[0] != 0,
                water: record[1] != 0,
                light: record[2] != 0,
            }
        };
        Some(Self {
            thresholds: Thresholds {
                temperature: word(0),
                humidity: word(1),
                light: word(2),
                soil_moisture: word(3),
            },
            mode,
        })
    }

    /// Apply a mode and switches update
    pub fn apply_control_update(&mut self, update: &ControlUpdate) {
        self.mode = if update.automatic {
            ControlMode::Automatic
        } else {
            ControlMode::Manual {
                fan: update.switches.fan,
                water: update.switches.water,
                light: update.switches.light,
            }
        };
    }

    /// Apply a thresholds update; the mode is left alone
    pub fn apply_threshold_update(&mut self, update: &ThresholdUpdate) {
        self.thresholds = Thresholds {
            temperature: update.temperature as i32,
            humidity: update.humidity as i32,
            light: update.light as i32,
            soil_moisture: update.soil_moisture as i32,
        };
    }
}

/// Actuator state of one group
///
/// `previous` is the state from the last decision; irrigation keeps it inside
/// the hysteresis band.
pub fn decide(
    aggregate: &GroupAggregate,
    control: &GroupControl,
    previous: ActuatorState,
) -> ActuatorState {
    if !aggregate.registered {
        return ActuatorState::OFF;
    }

    match control.mode {
        ControlMode::Manual { fan, water, light } => ActuatorState { fan, water, light },
        ControlMode::Automatic => {
            let th = &control.thresholds;
            let temperature = aggregate.temperature as i32;
            let humidity = aggregate.humidity as i32;
            let soil = aggregate.soil_moisture as i32;

            let fan = temperature > th.temperature || humidity > th.humidity;
            // Thresholds come from persisted records and may hold any i32.
            let water = if soil >= SOIL_SATURATED
                || i64::from(soil) * 100 > i64::from(th.soil_moisture) * WATER_HYSTERESIS_PERCENT
            {
                false
            } else if soil < th.soil_moisture {
                true
            } else {
                previous.water
            };

            ActuatorState {
                fan,
                water,
                light: true,
            }
        }
    }
}

/// State of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Configuration not loaded yet
    Init,
    /// Computing actuator states
    Decide,
    /// Parked until new measurements or a user request
    WaitForEvent,
}

/// Input of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Start-up
    Boot,
    /// New aggregates were pushed
    MeasurementsTaken,
    /// The user changed a group's configuration
    UserRequest,
}

/// Control engine shared between the measurement cycle and the inbound loop
pub type SharedEngine = Arc<Mutex<ControlEngine>>;

/// Lock a shared engine, recovering from a poisoned lock
pub fn lock_engine(engine: &SharedEngine) -> MutexGuard<'_, ControlEngine> {
    engine.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Environment control engine
pub struct ControlEngine {
    state: EngineState,
    groups: [GroupControl; MAX_GROUPS],
    measurements: [GroupAggregate; MAX_GROUPS],
    outputs: [ActuatorState; MAX_GROUPS],
    store: Arc<dyn ConfigStore>,
    writer: PersistHandle,
    decisions: u64,
}

impl ControlEngine {
    /// Engine reading from `store` and writing through `writer`
    pub fn new(store: Arc<dyn ConfigStore>, writer: PersistHandle) -> Self {
        let mut measurements = [GroupAggregate::default(); MAX_GROUPS];
        for (index, m) in measurements.iter_mut().enumerate() {
            m.group = index as u8 + 1;
        }
        Self {
            state: EngineState::Init,
            groups: [GroupControl::default(); MAX_GROUPS],
            measurements,
            outputs: [ActuatorState::OFF; MAX_GROUPS],
            store,
            writer,
            decisions: 0,
        }
    }

    /// Wrap into a [`SharedEngine`]
    pub fn into_shared(self) -> SharedEngine {
        Arc::new(Mutex::new(self))
    }

    /// Feed one event; returns the command when a decision was taken
    pub fn step(&mut self, event: ControlEvent) -> Option<ActuatorCommand> {
        match (self.state, event) {
            (EngineState::Init, ControlEvent::Boot) => {
                self.load_configuration();
                self.state = EngineState::Decide;
                Some(self.run_decision())
            }
            (EngineState::Init, other) => {
                warn!("Control event {:?} before boot, ignored", other);
                None
            }
            (_, ControlEvent::Boot) => {
                debug!("Control engine already booted");
                None
            }
            (_, event) => {
                debug!("Control engine woken by {:?}", event);
                self.state = EngineState::Decide;
                Some(self.run_decision())
            }
        }
    }

    /// Replace the measurement mirror
    pub fn update_measurements(&mut self, aggregates: &[GroupAggregate; MAX_GROUPS]) {
        self.measurements = *aggregates;
    }

    /// Apply a control update and persist the group record
    pub fn apply_control_update(&mut self, update: &ControlUpdate) -> Result<()> {
        let index = self.checked_index(update.group)?;
        self.groups[index].apply_control_update(update);
        info!(
            "Group {} set to {:?}",
            update.group, self.groups[index].mode
        );
        self.persist(index);
        Ok(())
    }

    /// Apply a thresholds update and persist the group record
    pub fn apply_threshold_update(&mut self, update: &ThresholdUpdate) -> Result<()> {
        let index = self.checked_index(update.group)?;
        self.groups[index].apply_threshold_update(update);
        info!(
            "Group {} thresholds {:?}",
            update.group, self.groups[index].thresholds
        );
        self.persist(index);
        Ok(())
    }

    /// Configuration of a group
    pub fn config(&self, group: u8) -> Option<GroupControl> {
        group_index(group).map(|i| self.groups[i])
    }

    /// Actuator states of the last decision
    pub fn outputs(&self) -> [ActuatorState; MAX_GROUPS] {
        self.outputs
    }

    /// Last decision as a command
    pub fn command(&self) -> ActuatorCommand {
        ActuatorCommand {
            groups: self.outputs,
        }
    }

    /// Current state
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Number of decisions taken
    pub fn decisions(&self) -> u64 {
        self.decisions
    }

    fn checked_index(&self, group: u8) -> Result<usize> {
        group_index(group).ok_or_else(|| {
            error!("Configuration update for group {} rejected", group);
            CoordinatorError::GroupOutOfRange(group)
        })
    }

    fn persist(&self, index: usize) {
        self.writer.submit(
            StoreKey::Group(index as u8),
            self.groups[index].to_record().to_vec(),
        );
    }

    fn load_configuration(&mut self) {
        for index in 0..MAX_GROUPS {
            let key = StoreKey::Group(index as u8);
            let loaded = match self.store.read(key) {
                Ok(Some(record)) => GroupControl::from_record(&record),
                Ok(None) => None,
                Err(e) => {
                    error!("Reading configuration of group {}: {}", index + 1, e);
                    None
                }
            };
            match loaded {
                Some(control) => self.groups[index] = control,
                None => {
                    info!("Installing default configuration for group {}", index + 1);
                    self.groups[index] = GroupControl::default();
                    self.persist(index);
                }
            }
        }
    }

    fn run_decision(&mut self) -> ActuatorCommand {
        for index in 0..MAX_GROUPS {
            self.outputs[index] = decide(
                &self.measurements[index],
                &self.groups[index],
                self.outputs[index],
            );
        }
        self.decisions += 1;
        self.state = EngineState::WaitForEvent;
        debug!("Actuator decision #{}: {:?}", self.decisions, self.outputs);
        self.command()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, PersistQueue};

    fn aggregate(temperature: i16, humidity: i16, soil: i16) -> GroupAggregate {
        GroupAggregate {
            group: 1,
            temperature,
            humidity,
            soil_moisture: soil,
            light: 100,
            actuators: ActuatorState::OFF,
            registered: true,
        }
    }

    fn engine(store: &MemoryStore) -> (ControlEngine, PersistQueue) {
        let queue = PersistQueue::spawn(Arc::new(store.clone())).unwrap();
        let engine = ControlEngine::new(Arc::new(store.clone()), queue.handle());
        (engine, queue)
    }

    #[test]
    fn test_extreme_persisted_threshold_does_not_overflow() {
        let mut control = GroupControl::default();
        control.thresholds.soil_moisture = i32::MAX;
        let control = GroupControl::from_record(&control.to_record()).unwrap();
        assert_eq!(control.thresholds.soil_moisture, i32::MAX);

        let state = decide(&aggregate(2000, 5000, 9000), &control, ActuatorState::OFF);
        assert!(state.water);

        let mut control = control;
        control.thresholds.soil_moisture = i32::MIN;
        let state = decide(&aggregate(2000, 5000, -9000), &control, ActuatorState::OFF);
        assert!(!state.water);
    }

    #[test]
    fn test_record_roundtrip() {
        let control = GroupControl {
            thresholds: Thresholds {
                temperature: -150,
                humidity: 6500,
                light: 300,
                soil_moisture: 4200,
            },
            mode: ControlMode::Manual {
                fan: true,
                water: false,
                light: true,
            },
        };
        let record = control.to_record();
        assert_eq!(&record[..4], &[1, 0, 1, 0]);
        assert_eq!(GroupControl::from_record(&record), Some(control));
        assert_eq!(GroupControl::from_record(&record[..19]), None);
    }

    #[test]
    fn test_unregistered_group_is_off() {
        let control = GroupControl {
            mode: ControlMode::Manual {
                fan: true,
                water: true,
                light: true,
            },
            ..Default::default()
        };
        let state = decide(&GroupAggregate::unregistered(2), &control, ActuatorState::OFF);
        assert_eq!(state, ActuatorState::OFF);
    }

    #[test]
    fn test_manual_mirrors_switches() {
        let control = GroupControl {
            mode: ControlMode::Manual {
                fan: false,
                water: true,
                light: false,
            },
            ..Default::default()
        };
        let state = decide(&aggregate(4000, 9000, 100), &control, ActuatorState::OFF);
        assert_eq!(
            state,
            ActuatorState {
                fan: false,
                water: true,
                light: false
            }
        );
    }

    #[test]
    fn test_fan_on_temperature_or_humidity() {
        let control = GroupControl::default();
        assert!(!decide(&aggregate(2800, 7000, 6000), &control, ActuatorState::OFF).fan);
        assert!(decide(&aggregate(2801, 5000, 6000), &control, ActuatorState::OFF).fan);
        assert!(decide(&aggregate(2000, 7001, 6000), &control, ActuatorState::OFF).fan);
        assert!(decide(&aggregate(2000, 5000, 6000), &control, ActuatorState::OFF).light);
    }

    #[test]
    fn test_water_hysteresis() {
        let control = GroupControl::default();
        let on = ActuatorState {
            water: true,
            ..ActuatorState::OFF
        };

        // Below threshold
        assert!(decide(&aggregate(2000, 5000, 5999), &control, ActuatorState::OFF).water);
        // At threshold: prior state kept
        assert!(decide(&aggregate(2000, 5000, 6000), &control, on).water);
        assert!(!decide(&aggregate(2000, 5000, 6000), &control, ActuatorState::OFF).water);
        // 1.09 x threshold, still inside the band
        assert!(decide(&aggregate(2000, 5000, 6540), &control, on).water);
        // 1.10 x threshold is the edge, still kept
        assert!(decide(&aggregate(2000, 5000, 6600), &control, on).water);
        // 1.11 x threshold
        assert!(!decide(&aggregate(2000, 5000, 6660), &control, on).water);
    }

    #[test]
    fn test_saturated_soil_stops_water() {
        let control = GroupControl {
            thresholds: Thresholds {
                soil_moisture: 12_000,
                ..Default::default()
            },
            mode: ControlMode::Automatic,
        };
        let on = ActuatorState {
            water: true,
            ..ActuatorState::OFF
        };
        assert!(!decide(&aggregate(2000, 5000, 10_000), &control, on).water);
        assert!(decide(&aggregate(2000, 5000, 9_999), &control, on).water);
    }

    #[test]
    fn test_boot_installs_defaults_once() {
        let store = MemoryStore::new();
        let (mut first, queue) = engine(&store);
        assert!(first.step(ControlEvent::Boot).is_some());
        queue.handle().flush().unwrap();
        assert_eq!(store.len(), MAX_GROUPS);

        let (mut second, queue2) = engine(&store);
        second.step(ControlEvent::Boot);
        queue2.handle().flush().unwrap();
        for group in 1..=MAX_GROUPS as u8 {
            assert_eq!(second.config(group), Some(GroupControl::default()));
            assert_eq!(second.config(group), first.config(group));
        }
    }

    #[test]
    fn test_boot_loads_stored_config() {
        let store = MemoryStore::new();
        let stored = GroupControl {
            mode: ControlMode::Manual {
                fan: true,
                water: false,
                light: false,
            },
            ..Default::default()
        };
        store
            .write(StoreKey::Group(3), &stored.to_record())
            .unwrap();

        let (mut engine, _queue) = engine(&store);
        engine.step(ControlEvent::Boot);
        assert_eq!(engine.config(4), Some(stored));
        assert_eq!(engine.state(), EngineState::WaitForEvent);
    }

    #[test]
    fn test_events_before_boot_ignored() {
        let store = MemoryStore::new();
        let (mut engine, _queue) = engine(&store);
        assert_eq!(engine.step(ControlEvent::MeasurementsTaken), None);
        assert_eq!(engine.state(), EngineState::Init);
        assert_eq!(engine.decisions(), 0);
    }

    #[test]
    fn test_measurements_drive_command() {
        let store = MemoryStore::new();
        let (mut engine, _queue) = engine(&store);
        engine.step(ControlEvent::Boot);

        let mut aggregates = [GroupAggregate::default(); MAX_GROUPS];
        for (i, a) in aggregates.iter_mut().enumerate() {
            *a = GroupAggregate::unregistered(i as u8 + 1);
        }
        aggregates[0] = aggregate(3000, 5000, 5000);
        engine.update_measurements(&aggregates);

        let command = engine.step(ControlEvent::MeasurementsTaken).unwrap();
        assert_eq!(
            command.groups[0],
            ActuatorState {
                fan: true,
                water: true,
                light: true
            }
        );
        assert!(command.groups[1..].iter().all(|s| *s == ActuatorState::OFF));
        assert_eq!(engine.decisions(), 2);
    }

    #[test]
    fn test_threshold_update_kept_in_manual_mode() {
        let store = MemoryStore::new();
        let (mut engine, queue) = engine(&store);
        engine.step(ControlEvent::Boot);

        engine
            .apply_control_update(&ControlUpdate {
                group: 2,
                automatic: false,
                switches: ActuatorState::OFF,
            })
            .unwrap();
        engine
            .apply_threshold_update(&ThresholdUpdate {
                group: 2,
                temperature: 2500,
                humidity: 6000,
                light: 50,
                soil_moisture: 3000,
            })
            .unwrap();
        engine
            .apply_control_update(&ControlUpdate {
                group: 2,
                automatic: true,
                switches: ActuatorState::OFF,
            })
            .unwrap();

        let config = engine.config(2).unwrap();
        assert_eq!(config.mode, ControlMode::Automatic);
        assert_eq!(config.thresholds.temperature, 2500);

        queue.handle().flush().unwrap();
        let record = store.read(StoreKey::Group(1)).unwrap().unwrap();
        assert_eq!(GroupControl::from_record(&record), Some(config));
    }

    #[test]
    fn test_out_of_range_update_is_noop() {
        let store = MemoryStore::new();
        let (mut engine, _queue) = engine(&store);
        engine.step(ControlEvent::Boot);
        let before: Vec<_> = (1..=5).map(|g| engine.config(g)).collect();

        let result = engine.apply_control_update(&ControlUpdate {
            group: 6,
            automatic: false,
            switches: ActuatorState::OFF,
        });
        assert!(matches!(result, Err(CoordinatorError::GroupOutOfRange(6))));
        let after: Vec<_> = (1..=5).map(|g| engine.config(g)).collect();
        assert_eq!(before, after);
    }
}
