// AgriNet - Row-level greenhouse monitoring and control
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Protocol definitions for AgriNet
//!
//! This module defines the records exchanged on the two links of a
//! coordinator:
//! - the internal link between the coordinator and its relay MCU
//! - the wide-area link between the relay and the cloud collector
//!
//! Every record is a fixed-layout little-endian message:
//!
//! ```text
//! +------+-----+-------------------+---------+
//! | type | len | payload           | crc16   |
//! | u8   | u8  | fixed per type    | u16 LE  |
//! +------+-----+-------------------+---------+
//! ```
//!
//! `len` is the total frame size including the type, length and CRC bytes.

use std::fmt;

/// Number of groups (rows) a coordinator manages
pub const MAX_GROUPS: usize = 5;

/// Length of an ASCII MAC address (`AA:BB:CC:DD:EE:FF`)
pub const MAC_ADDRESS_LEN: usize = 17;

/// Bytes taken by the type and length prefix
pub const HEADER_SIZE: usize = 2;

/// Bytes taken by the trailing CRC16
pub const CRC_SIZE: usize = 2;

/// Smallest possible frame (header + CRC, empty payload)
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + CRC_SIZE;

/// Largest frame of any known type
pub const MAX_FRAME_SIZE: usize = 39;

/// Soil moisture reading that means "saturated" (100.00 %)
pub const SOIL_SATURATED: i32 = 10_000;

/// Which link a message type belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkKind {
    /// Coordinator <-> relay serial link
    Internal,
    /// Relay <-> cloud collector
    WideArea,
}

/// Message types of the AgriNet protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Raw sample of one peer
    RawSample = 0xA1,
    /// Mean values of one group
    GroupAggregate = 0xA2,
    /// Operation result / acknowledgement
    OperationResult = 0xFD,
    /// End of a relay batch
    ReadyToRelay = 0xC0,
    /// Actuator states for every group
    ActuatorCommand = 0x82,
    /// Clock synchronisation request
    TimestampSync = 0x83,
    /// Group aggregate bound for the cloud
    CloudAggregate = 0xB1,
    /// Mode and manual switches set by the user
    ControlUpdate = 0xB2,
    /// Thresholds set by the user
    ThresholdUpdate = 0xB3,
}

impl MessageType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0xA1 => Some(MessageType::RawSample),
            0xA2 => Some(MessageType::GroupAggregate),
            0xFD => Some(MessageType::OperationResult),
            0xC0 => Some(MessageType::ReadyToRelay),
            0x82 => Some(MessageType::ActuatorCommand),
            0x83 => Some(MessageType::TimestampSync),
            0xB1 => Some(MessageType::CloudAggregate),
            0xB2 => Some(MessageType::ControlUpdate),
            0xB3 => Some(MessageType::ThresholdUpdate),
            _ => None,
        }
    }

    /// Total frame size of this type, CRC included
    pub fn frame_len(&self) -> usize {
        let payload = match self {
            MessageType::RawSample => MAC_ADDRESS_LEN + 4 * 4 + 2,
            MessageType::GroupAggregate => 4 * 2 + 4 + 1,
            MessageType::OperationResult => 2,
            MessageType::ReadyToRelay | MessageType::TimestampSync => 0,
            MessageType::ActuatorCommand => 3 * MAX_GROUPS,
            MessageType::CloudAggregate => 2 + 3 * 2 + 1 + 8 + 3,
            MessageType::ControlUpdate => 5,
            MessageType::ThresholdUpdate => 1 + 4 * 2,
        };
        HEADER_SIZE + payload + CRC_SIZE
    }

    /// Link this message type travels on
    pub fn link(&self) -> LinkKind {
        match self {
            MessageType::CloudAggregate
            | MessageType::ControlUpdate
            | MessageType::ThresholdUpdate => LinkKind::WideArea,
            _ => LinkKind::Internal,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::RawSample => "RAW_SAMPLE",
            MessageType::GroupAggregate => "GROUP_AGGREGATE",
            MessageType::OperationResult => "OPERATION_RESULT",
            MessageType::ReadyToRelay => "READY",
            MessageType::ActuatorCommand => "ACTUATOR_COMMAND",
            MessageType::TimestampSync => "TIMESTAMP_SYNC",
            MessageType::CloudAggregate => "CLOUD_AGGREGATE",
            MessageType::ControlUpdate => "CONTROL_UPDATE",
            MessageType::ThresholdUpdate => "THRESHOLD_UPDATE",
        };
        write!(f, "{}(0x{:02X})", name, *self as u8)
    }
}

/// ASCII MAC address as carried on the wire
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; MAC_ADDRESS_LEN]);

impl MacAddress {
    /// Build from the 17 raw ASCII bytes
    ///
    /// Returns `None` if any byte is not printable ASCII.
    pub fn from_bytes(bytes: [u8; MAC_ADDRESS_LEN]) -> Option<Self> {
        if bytes.iter().all(|b| b.is_ascii_graphic()) {
            Some(Self(bytes))
        } else {
            None
        }
    }

    /// Build from six octets, formatted as upper-case hex
    pub fn from_octets(octets: [u8; 6]) -> Self {
        let text = format!(
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            octets[0], octets[1], octets[2], octets[3], octets[4], octets[5]
        );
        let mut bytes = [0u8; MAC_ADDRESS_LEN];
        bytes.copy_from_slice(text.as_bytes());
        Self(bytes)
    }

    /// Parse `AA:BB:CC:DD:EE:FF`
    pub fn parse(text: &str) -> Option<Self> {
        let bytes: [u8; MAC_ADDRESS_LEN] = text.as_bytes().try_into().ok()?;
        Self::from_bytes(bytes)
    }

    /// Raw ASCII bytes
    pub fn as_bytes(&self) -> &[u8; MAC_ADDRESS_LEN] {
        &self.0
    }

    /// Text form
    pub fn as_str(&self) -> &str {
        // Constructors only admit ASCII.
        std::str::from_utf8(&self.0).unwrap_or("??:??:??:??:??:??")
    }
}

impl Default for MacAddress {
    fn default() -> Self {
        Self(*b"00:00:00:00:00:00")
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({})", self.as_str())
    }
}

/// On/off state of the three actuators of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ActuatorState {
    /// Ventilation fan
    pub fan: bool,
    /// Irrigation valve
    pub water: bool,
    /// Grow light
    pub light: bool,
}

impl ActuatorState {
    /// Everything off
    pub const OFF: ActuatorState = ActuatorState {
        fan: false,
        water: false,
        light: false,
    };
}

/// One peer's readings for a cycle
///
/// Temperature is in hundredths of a degree, humidity and soil moisture in
/// hundredths of a percent, light in sensor units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawSample {
    /// Peer address
    pub mac: MacAddress,
    /// Temperature (0.01 °C)
    pub temperature: i32,
    /// Relative humidity (0.01 %)
    pub humidity: i32,
    /// Soil moisture (0.01 %)
    pub soil_moisture: i32,
    /// Light intensity
    pub light: i32,
    /// Battery level, 0-100
    pub battery: u8,
    /// Group id, 0 when the peer is not configured yet
    pub group: u8,
}

impl RawSample {
    /// Whether the group id is in `1..=MAX_GROUPS`
    pub fn has_valid_group(&self) -> bool {
        is_valid_group(self.group)
    }
}

/// Mean values of one group over a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupAggregate {
    /// Group id, 1-based
    pub group: u8,
    /// Mean temperature (0.01 °C)
    pub temperature: i16,
    /// Mean humidity (0.01 %)
    pub humidity: i16,
    /// Mean soil moisture (0.01 %)
    pub soil_moisture: i16,
    /// Mean light
    pub light: i16,
    /// Actuator snapshot
    pub actuators: ActuatorState,
    /// At least one live peer reported this group
    pub registered: bool,
}

impl GroupAggregate {
    /// Zeroed, unregistered aggregate for `group`
    pub fn unregistered(group: u8) -> Self {
        Self {
            group,
            ..Default::default()
        }
    }
}

/// Actuator states for every group, index 0 is group 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActuatorCommand {
    /// Per-group actuator states
    pub groups: [ActuatorState; MAX_GROUPS],
}

/// Group aggregate as sent to the cloud collector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CloudAggregate {
    /// Group id, 1-based
    pub group: u8,
    /// Mean temperature (0.01 °C)
    pub temperature: i16,
    /// Mean humidity (0.01 %)
    pub humidity: u16,
    /// Mean soil moisture (0.01 %)
    pub soil_moisture: u16,
    /// Mean light
    pub light: u16,
    /// Unix time in milliseconds
    pub timestamp_ms: i64,
    /// Actuator snapshot
    pub actuators: ActuatorState,
}

impl CloudAggregate {
    /// Build the cloud record for a group aggregate
    pub fn from_aggregate(aggregate: &GroupAggregate, timestamp_ms: i64) -> Self {
        Self {
            group: aggregate.group,
            temperature: aggregate.temperature,
            humidity: aggregate.humidity.max(0) as u16,
            soil_moisture: aggregate.soil_moisture.max(0) as u16,
            light: aggregate.light.max(0) as u16,
            timestamp_ms,
            actuators: aggregate.actuators,
        }
    }
}

/// Mode and manual switches pushed by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlUpdate {
    /// Group id, 1-based
    pub group: u8,
    /// Automatic mode requested
    pub automatic: bool,
    /// Manual switches (used in manual mode)
    pub switches: ActuatorState,
}

/// Thresholds pushed by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThresholdUpdate {
    /// Group id, 1-based
    pub group: u8,
    /// Temperature threshold (0.01 °C)
    pub temperature: i16,
    /// Humidity threshold (0.01 %)
    pub humidity: u16,
    /// Light threshold
    pub light: u16,
    /// Soil moisture threshold (0.01 %)
    pub soil_moisture: u16,
}

/// Operation result code carried by `0xFD` frames
///
/// Unknown codes are kept as raw values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultCode(pub u16);

impl ResultCode {
    /// Raw sample stored
    pub const MEASUREMENTS_OK: ResultCode = ResultCode(0x0001);
    /// Raw sample failed its CRC
    pub const MEASUREMENTS_CRC_ERROR: ResultCode = ResultCode(0x0002);
    /// Raw sample rejected
    pub const MEASUREMENTS_FAILED: ResultCode = ResultCode(0x0004);
    /// Group aggregate stored
    pub const GROUP_MEAN_OK: ResultCode = ResultCode(0x0008);
    /// Group aggregate failed its CRC
    pub const GROUP_MEAN_CRC_ERROR: ResultCode = ResultCode(0x0010);
    /// Group aggregate rejected
    pub const GROUP_MEAN_FAILED: ResultCode = ResultCode(0x0020);
    /// Cloud batch failed its CRC
    pub const CLOUD_SEND_CRC_ERROR: ResultCode = ResultCode(0x0040);
    /// Cloud batch accepted
    pub const CLOUD_SEND_OK: ResultCode = ResultCode(0x0080);
    /// Actuator command applied
    pub const ACTUATORS_OK: ResultCode = ResultCode(0x0100);
    /// Actuator command failed its CRC
    pub const ACTUATORS_CRC_ERROR: ResultCode = ResultCode(0x0200);
    /// Clock update failed
    pub const TIMESTAMP_FAILED: ResultCode = ResultCode(0x0300);
    /// Clock updated
    pub const TIMESTAMP_OK: ResultCode = ResultCode(0x0400);
    /// Anything else
    pub const GENERIC_ERROR: ResultCode = ResultCode(0x00FF);

    /// Whether the code reports success
    pub fn is_success(&self) -> bool {
        matches!(
            *self,
            Self::MEASUREMENTS_OK
                | Self::GROUP_MEAN_OK
                | Self::CLOUD_SEND_OK
                | Self::ACTUATORS_OK
                | Self::TIMESTAMP_OK
        )
    }

    /// Request type this code answers, `None` for codes not tied to one
    pub fn request_type(&self) -> Option<MessageType> {
        match *self {
            Self::MEASUREMENTS_OK | Self::MEASUREMENTS_CRC_ERROR | Self::MEASUREMENTS_FAILED => {
                Some(MessageType::RawSample)
            }
            Self::GROUP_MEAN_OK | Self::GROUP_MEAN_CRC_ERROR | Self::GROUP_MEAN_FAILED => {
                Some(MessageType::GroupAggregate)
            }
            Self::CLOUD_SEND_OK | Self::CLOUD_SEND_CRC_ERROR => Some(MessageType::ReadyToRelay),
            Self::ACTUATORS_OK | Self::ACTUATORS_CRC_ERROR => Some(MessageType::ActuatorCommand),
            Self::TIMESTAMP_OK | Self::TIMESTAMP_FAILED => Some(MessageType::TimestampSync),
            _ => None,
        }
    }

    /// Whether this code is a valid answer to a frame of `msg_type`
    ///
    /// The generic error answers whatever is in flight; the receiver sends it
    /// when the frame type itself was unreadable.
    pub fn answers(&self, msg_type: MessageType) -> bool {
        *self == Self::GENERIC_ERROR || self.request_type() == Some(msg_type)
    }

    /// CRC-error code the receiver answers with for a given message type
    pub fn crc_error_for(msg_type: MessageType) -> ResultCode {
        match msg_type {
            MessageType::RawSample => Self::MEASUREMENTS_CRC_ERROR,
            MessageType::GroupAggregate => Self::GROUP_MEAN_CRC_ERROR,
            MessageType::ReadyToRelay => Self::CLOUD_SEND_CRC_ERROR,
            MessageType::ActuatorCommand => Self::ACTUATORS_CRC_ERROR,
            MessageType::TimestampSync => Self::TIMESTAMP_FAILED,
            _ => Self::GENERIC_ERROR,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// A decoded message of either link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// `0xA1`
    RawSample(RawSample),
    /// `0xA2`
    GroupAggregate(GroupAggregate),
    /// `0xFD`
    OperationResult(ResultCode),
    /// `0xC0`
    ReadyToRelay,
    /// `0x82`
    ActuatorCommand(ActuatorCommand),
    /// `0x83`
    TimestampSync,
    /// `0xB1`
    CloudAggregate(CloudAggregate),
    /// `0xB2`
    ControlUpdate(ControlUpdate),
    /// `0xB3`
    ThresholdUpdate(ThresholdUpdate),
}

impl Message {
    /// Type byte of this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::RawSample(_) => MessageType::RawSample,
            Message::GroupAggregate(_) => MessageType::GroupAggregate,
            Message::OperationResult(_) => MessageType::OperationResult,
            Message::ReadyToRelay => MessageType::ReadyToRelay,
            Message::ActuatorCommand(_) => MessageType::ActuatorCommand,
            Message::TimestampSync => MessageType::TimestampSync,
            Message::CloudAggregate(_) => MessageType::CloudAggregate,
            Message::ControlUpdate(_) => MessageType::ControlUpdate,
            Message::ThresholdUpdate(_) => MessageType::ThresholdUpdate,
        }
    }
}

/// Whether `group` is a valid 1-based group id
pub fn is_valid_group(group: u8) -> bool {
    (1..=MAX_GROUPS as u8).contains(&group)
}

/// Array index of a 1-based group id
pub fn group_index(group: u8) -> Option<usize> {
    if is_valid_group(group) {
        Some(group as usize - 1)
    } else {
        None
    }
}
