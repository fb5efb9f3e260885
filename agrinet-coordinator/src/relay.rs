// AgriNet Coordinator - Cross-link orchestration layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Relay side of the internal link
//!
//! The relay receives the coordinator's frames, stages samples and
//! aggregates for the wide-area session, drives the actuator outputs, and
//! answers every accepted frame with an operation result.

use crate::clock::Clock;
use crate::error::{CoordinatorError, Result};
use agrinet::{
    decode, encode, group_index, peek_type, ActuatorCommand, AgrinetError, Channel,
    ChannelError, ChannelMetrics, DecodeError, Frame, GroupAggregate, Message, RawSample,
    ResultCode, MAX_GROUPS,
};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Staging area read by the wide-area session
#[derive(Debug, Clone)]
pub struct RelayInventory {
    devices: Vec<RawSample>,
    capacity: usize,
    aggregates: [Option<GroupAggregate>; MAX_GROUPS],
    clock_ms: Option<i64>,
}

impl RelayInventory {
    /// Inventory holding up to `capacity` device samples
    pub fn new(capacity: usize) -> Self {
        Self {
            devices: Vec::with_capacity(capacity),
            capacity,
            aggregates: [None; MAX_GROUPS],
            clock_ms: None,
        }
    }

    /// Wrap into a [`SharedInventory`]
    pub fn into_shared(self) -> SharedInventory {
        Arc::new(Mutex::new(self))
    }

    /// Stage a raw sample, replacing an earlier one from the same peer
    pub fn store_sample(&mut self, sample: RawSample) -> Result<()> {
        if let Some(existing) = self.devices.iter_mut().find(|d| d.mac == sample.mac) {
            *existing = sample;
            return Ok(());
        }
        if self.devices.len() >= self.capacity {
            return Err(CoordinatorError::CapacityExceeded {
                what: "relay device inventory",
                max: self.capacity,
            });
        }
        self.devices.push(sample);
        Ok(())
    }

    /// Stage a group aggregate
    pub fn store_aggregate(&mut self, aggregate: GroupAggregate) -> Result<()> {
        let index =
            group_index(aggregate.group).ok_or(CoordinatorError::GroupOutOfRange(aggregate.group))?;
        self.aggregates[index] = Some(aggregate);
        Ok(())
    }

    /// Staged aggregates of registered groups, by group
    pub fn registered_aggregates(&self) -> Vec<GroupAggregate> {
        self.aggregates
            .iter()
            .flatten()
            .filter(|a| a.registered)
            .copied()
            .collect()
    }

    /// Staged device samples
    pub fn devices(&self) -> &[RawSample] {
        &self.devices
    }

    /// Drop every staged aggregate
    pub fn clear_aggregates(&mut self) {
        self.aggregates = [None; MAX_GROUPS];
    }

    /// Drop every staged device sample
    pub fn clear_devices(&mut self) {
        self.devices.clear();
    }

    /// Record the time of the last clock sync
    pub fn set_clock(&mut self, now_ms: i64) {
        self.clock_ms = Some(now_ms);
    }

    /// Time of the last clock sync
    pub fn clock_ms(&self) -> Option<i64> {
        self.clock_ms
    }
}

/// Inventory shared between the relay endpoint and the session
pub type SharedInventory = Arc<Mutex<RelayInventory>>;

pub(crate) fn lock_inventory(inventory: &SharedInventory) -> MutexGuard<'_, RelayInventory> {
    inventory
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Physical actuator drivers of the relay board
pub trait ActuatorOutputs: Send {
    /// Drive every group's outputs
    fn apply(&mut self, command: &ActuatorCommand);
}

/// Outputs that log commands and keep the last one
#[derive(Debug, Clone, Default)]
pub struct OutputLog {
    last: Arc<Mutex<Option<ActuatorCommand>>>,
}

impl OutputLog {
    /// Empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Last applied command
    pub fn last(&self) -> Option<ActuatorCommand> {
        self.last.lock().ok().and_then(|l| *l)
    }
}

impl ActuatorOutputs for OutputLog {
    fn apply(&mut self, command: &ActuatorCommand) {
        for (index, state) in command.groups.iter().enumerate() {
            debug!(
                "Group {} outputs: fan={} water={} light={}",
                index + 1,
                state.fan,
                state.water,
                state.light
            );
        }
        if let Ok(mut last) = self.last.lock() {
            *last = Some(*command);
        }
    }
}

/// Reply to one inbound frame
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RelayReply {
    /// Encoded operation result, if the frame is answered
    pub frame: Option<Frame>,
    /// The frame was the ready sentinel
    pub data_ready: bool,
}

impl RelayReply {
    fn code(code: ResultCode) -> Self {
        Self {
            frame: Some(encode(&Message::OperationResult(code))),
            data_ready: false,
        }
    }
}

/// Relay-side frame handler
pub struct RelayEndpoint<O: ActuatorOutputs> {
    inventory: SharedInventory,
    outputs: O,
    clock: Arc<dyn Clock>,
}

impl<O: ActuatorOutputs> RelayEndpoint<O> {
    /// Endpoint staging into `inventory`
    pub fn new(inventory: SharedInventory, outputs: O, clock: Arc<dyn Clock>) -> Self {
        Self {
            inventory,
            outputs,
            clock,
        }
    }

    /// Handle one complete frame
    pub fn on_frame(&mut self, frame: &[u8]) -> RelayReply {
        let message = match decode(frame) {
            Ok(message) => message,
            Err(DecodeError::CrcMismatch { .. }) => {
                let code = peek_type(frame)
                    .map(ResultCode::crc_error_for)
                    .unwrap_or(ResultCode::GENERIC_ERROR);
                warn!("Frame failed its CRC, answering {}", code);
                return RelayReply::code(code);
            }
            Err(e) => {
                warn!("Dropping frame from coordinator: {}", e);
                return RelayReply::default();
            }
        };

        match message {
            Message::RawSample(sample) => {
                match lock_inventory(&self.inventory).store_sample(sample) {
                    Ok(()) => RelayReply::code(ResultCode::MEASUREMENTS_OK),
                    Err(e) => {
                        warn!("Sample from {} not staged: {}", sample.mac, e);
                        RelayReply::code(ResultCode::MEASUREMENTS_FAILED)
                    }
                }
            }
            Message::GroupAggregate(aggregate) => {
                match lock_inventory(&self.inventory).store_aggregate(aggregate) {
                    Ok(()) => RelayReply::code(ResultCode::GROUP_MEAN_OK),
                    Err(e) => {
                        warn!("Aggregate not staged: {}", e);
                        RelayReply::code(ResultCode::GROUP_MEAN_FAILED)
                    }
                }
            }
            Message::ReadyToRelay => {
                info!("Relay batch complete, data ready");
                RelayReply {
                    data_ready: true,
                    ..RelayReply::code(ResultCode::CLOUD_SEND_OK)
                }
            }
            Message::ActuatorCommand(command) => {
                self.outputs.apply(&command);
                RelayReply::code(ResultCode::ACTUATORS_OK)
            }
            Message::TimestampSync => {
                lock_inventory(&self.inventory).set_clock(self.clock.now_ms());
                RelayReply::code(ResultCode::TIMESTAMP_OK)
            }
            other => {
                warn!("Unexpected {} on the internal link, dropped", other.message_type());
                RelayReply::default()
            }
        }
    }

    /// Shared inventory
    pub fn inventory(&self) -> SharedInventory {
        Arc::clone(&self.inventory)
    }

    /// Actuator outputs
    pub fn outputs(&self) -> &O {
        &self.outputs
    }
}

type ReadyHook = Box<dyn FnMut() + Send>;

/// In-process internal link ending in a [`RelayEndpoint`]
///
/// Frames sent by the coordinator are handled immediately; replies are
/// queued for [`Channel::receive`].
pub struct RelayLoopback<O: ActuatorOutputs> {
    endpoint: RelayEndpoint<O>,
    replies: VecDeque<Frame>,
    on_ready: Option<ReadyHook>,
    metrics: ChannelMetrics,
    open: bool,
}

impl<O: ActuatorOutputs> RelayLoopback<O> {
    /// Loopback delivering to `endpoint`
    pub fn new(endpoint: RelayEndpoint<O>) -> Self {
        Self {
            endpoint,
            replies: VecDeque::new(),
            on_ready: None,
            metrics: ChannelMetrics::default(),
            open: true,
        }
    }

    /// Call `hook` whenever the ready sentinel arrives
    pub fn with_ready_hook(mut self, hook: impl FnMut() + Send + 'static) -> Self {
        self.on_ready = Some(Box::new(hook));
        self
    }

    /// Relay endpoint
    pub fn endpoint(&self) -> &RelayEndpoint<O> {
        &self.endpoint
    }

    fn closed() -> AgrinetError {
        ChannelError::Disconnected {
            reason: "relay loopback closed".to_string(),
        }
        .into()
    }
}

impl<O: ActuatorOutputs> Channel for RelayLoopback<O> {
    fn send(&mut self, frame: Frame) -> agrinet::Result<()> {
        if !self.open {
            return Err(Self::closed());
        }
        self.metrics.bytes_sent += frame.len() as u64;
        self.metrics.frames_sent += 1;

        let reply = self.endpoint.on_frame(&frame);
        if let Some(answer) = reply.frame {
            self.replies.push_back(answer);
        }
        if reply.data_ready {
            if let Some(hook) = self.on_ready.as_mut() {
                hook();
            }
        }
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> agrinet::Result<Frame> {
        if !self.open {
            return Err(Self::closed());
        }
        match self.replies.pop_front() {
            Some(frame) => {
                self.metrics.bytes_received += frame.len() as u64;
                self.metrics.frames_received += 1;
                Ok(frame)
            }
            None => Err(ChannelError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }
            .into()),
        }
    }

    fn is_available(&self) -> bool {
        self.open
    }

    fn metrics(&self) -> ChannelMetrics {
        self.metrics.clone()
    }

    fn close(&mut self) {
        self.open = false;
    }
}
