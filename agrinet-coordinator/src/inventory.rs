// AgriNet Coordinator - Cross-link orchestration layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Aggregation and inventory store
//!
//! Holds the raw sample of every connected peer for the current sweep and
//! the per-group aggregates derived from them. Aggregates are recomputed
//! from scratch every sweep.

use crate::error::{CoordinatorError, Result};
use crate::link::SlotHandle;
use agrinet::{group_index, ActuatorState, GroupAggregate, RawSample, MAX_GROUPS};
use log::{debug, info};

/// Compute the aggregate of every group from the live samples
///
/// Means use integer division (truncation). A group with no matching sample
/// is returned zeroed and unregistered; there is no division in that case.
/// The actuator snapshot is left off; [`AggregateStore`] fills it in.
pub fn recompute_aggregates(samples: &[RawSample]) -> [GroupAggregate; MAX_GROUPS] {
    let mut sums = [[0i64; 4]; MAX_GROUPS];
    let mut counts = [0i64; MAX_GROUPS];

    for sample in samples {
        let Some(index) = group_index(sample.group) else {
            continue;
        };
        sums[index][0] += sample.temperature as i64;
        sums[index][1] += sample.humidity as i64;
        sums[index][2] += sample.soil_moisture as i64;
        sums[index][3] += sample.light as i64;
        counts[index] += 1;
    }

    let mut aggregates = [GroupAggregate::default(); MAX_GROUPS];
    for (index, aggregate) in aggregates.iter_mut().enumerate() {
        let group = index as u8 + 1;
        let count = counts[index];
        if count == 0 {
            *aggregate = GroupAggregate::unregistered(group);
            continue;
        }
        let mean = |field: usize| saturate_i16(sums[index][field] / count);
        *aggregate = GroupAggregate {
            group,
            temperature: mean(0),
            humidity: mean(1),
            soil_moisture: mean(2),
            light: mean(3),
            actuators: ActuatorState::OFF,
            registered: true,
        };
    }

    aggregates
}

fn saturate_i16(value: i64) -> i16 {
    value.clamp(i16::MIN as i64, i16::MAX as i64) as i16
}

/// Per-peer samples and per-group aggregates
#[derive(Debug)]
pub struct AggregateStore {
    samples: Vec<Option<RawSample>>,
    aggregates: [GroupAggregate; MAX_GROUPS],
    actuators: [ActuatorState; MAX_GROUPS],
}

impl AggregateStore {
    /// Store sized for `max_peers` samples
    pub fn new(max_peers: usize) -> Self {
        let mut aggregates = [GroupAggregate::default(); MAX_GROUPS];
        for (index, aggregate) in aggregates.iter_mut().enumerate() {
            aggregate.group = index as u8 + 1;
        }
        Self {
            samples: vec![None; max_peers],
            aggregates,
            actuators: [ActuatorState::OFF; MAX_GROUPS],
        }
    }

    /// Forget every sample before a new sweep
    pub fn begin_sweep(&mut self) {
        self.samples.iter_mut().for_each(|s| *s = None);
    }

    /// Record the sample read from a slot
    pub fn record(&mut self, slot: SlotHandle, sample: RawSample) -> Result<()> {
        let max = self.samples.len();
        let entry = self
            .samples
            .get_mut(slot.index())
            .ok_or(CoordinatorError::CapacityExceeded {
                what: "sample table",
                max,
            })?;
        *entry = Some(sample);
        Ok(())
    }

    /// Drop the sample of a slot whose peer timed out
    pub fn abandon(&mut self, slot: SlotHandle) {
        if let Some(entry) = self.samples.get_mut(slot.index()) {
            *entry = None;
        }
    }

    /// Samples recorded in the current sweep
    pub fn live_samples(&self) -> Vec<RawSample> {
        self.samples.iter().flatten().copied().collect()
    }

    /// Recompute every aggregate from the live samples
    pub fn recompute(&mut self) -> [GroupAggregate; MAX_GROUPS] {
        let fresh = recompute_aggregates(&self.live_samples());

        for (old, new) in self.aggregates.iter().zip(fresh.iter()) {
            match (old.registered, new.registered) {
                (false, true) => info!("Group {} registered", new.group),
                (true, false) => info!("Group {} no longer reported, reset", new.group),
                _ => {}
            }
        }

        self.aggregates = fresh;
        self.apply_actuators();
        debug!(
            "Aggregates recomputed, {} group(s) registered",
            self.registered_count()
        );
        self.aggregates
    }

    /// Zero every aggregate
    pub fn reset_all(&mut self) {
        for (index, aggregate) in self.aggregates.iter_mut().enumerate() {
            *aggregate = GroupAggregate::unregistered(index as u8 + 1);
        }
        info!("All group aggregates reset");
    }

    /// Snapshot of every aggregate
    pub fn aggregates(&self) -> [GroupAggregate; MAX_GROUPS] {
        self.aggregates
    }

    /// Aggregate of one group
    pub fn aggregate(&self, group: u8) -> Option<GroupAggregate> {
        group_index(group).map(|i| self.aggregates[i])
    }

    /// Aggregates of registered groups
    pub fn registered(&self) -> Vec<GroupAggregate> {
        self.aggregates
            .iter()
            .filter(|a| a.registered)
            .copied()
            .collect()
    }

    /// Number of registered groups
    pub fn registered_count(&self) -> usize {
        self.aggregates.iter().filter(|a| a.registered).count()
    }

    /// Actuator state of a group
    pub fn actuators(&self, group: u8) -> Result<ActuatorState> {
        group_index(group)
            .map(|i| self.actuators[i])
            .ok_or(CoordinatorError::GroupOutOfRange(group))
    }

    /// Set the actuator state of a group
    pub fn set_actuators(&mut self, group: u8, state: ActuatorState) -> Result<()> {
        let index = group_index(group).ok_or(CoordinatorError::GroupOutOfRange(group))?;
        self.actuators[index] = state;
        self.aggregates[index].actuators = state;
        Ok(())
    }

    /// Replace the whole actuator mirror
    pub fn set_all_actuators(&mut self, states: [ActuatorState; MAX_GROUPS]) {
        self.actuators = states;
        self.apply_actuators();
    }

    fn apply_actuators(&mut self) {
        for (aggregate, state) in self.aggregates.iter_mut().zip(self.actuators.iter()) {
            aggregate.actuators = *state;
        }
    }
}
