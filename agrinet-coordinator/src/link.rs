// AgriNet Coordinator - Cross-link orchestration layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Wireless link manager
//!
//! Owns the bounded pool of short-range peer connections. The radio stack is
//! reached through [`PeerRadio`]; its connection callbacks arrive as
//! [`LinkEvent`]s that the owning task feeds to [`LinkManager::handle_event`].
//!
//! ```text
//!  Idle ──start_scan──▶ Scanning ──DeviceFound──▶ Connecting
//!   ▲                                                 │ Connected
//!   │                                                 ▼
//!   └──── discovery done / failed ◀── CharacteristicDiscovery
//! ```
//!
//! At most one connect attempt is in flight. An attempt the radio never
//! completes is cancelled after the connect timeout and its slot freed. A
//! slot is only read while its [`SlotState`] is `Connected`.

use crate::config::CoordinatorConfig;
use crate::error::Result;
use agrinet::{MacAddress, RawSample};
use log::{debug, info, warn};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Number of characteristics resolved per peer
pub const CHARACTERISTIC_COUNT: usize = 6;

/// Opaque connection handle issued by the radio stack
pub type ConnHandle = u16;

/// Characteristics a sensor peer exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    /// Ambient temperature (0.01 °C)
    Temperature = 0,
    /// Ambient humidity (0.01 %)
    Humidity = 1,
    /// Soil moisture (0.01 %)
    SoilMoisture = 2,
    /// Light exposure
    Light = 3,
    /// Group the peer is configured for
    ConfigurationId = 4,
    /// Battery level (%)
    Battery = 5,
}

impl Characteristic {
    /// Discovery and read order
    pub const ALL: [Characteristic; CHARACTERISTIC_COUNT] = [
        Characteristic::Temperature,
        Characteristic::Humidity,
        Characteristic::SoilMoisture,
        Characteristic::Light,
        Characteristic::ConfigurationId,
        Characteristic::Battery,
    ];

    /// 128-bit UUID of the characteristic
    pub fn uuid(&self) -> u128 {
        match self {
            // Bluetooth SIG assigned numbers on the base UUID
            Characteristic::Temperature => 0x0000_2a6e_0000_1000_8000_0080_5f9b_34fb,
            Characteristic::Humidity => 0x0000_2a6f_0000_1000_8000_0080_5f9b_34fb,
            Characteristic::Battery => 0x0000_2a19_0000_1000_8000_0080_5f9b_34fb,
            Characteristic::SoilMoisture => 0x07a3_e336_ccad_11ec_9d64_0242_ac12_0002,
            Characteristic::Light => 0x0b20_8f09_a0bf_4d57_b778_38f8_9926_4e76,
            Characteristic::ConfigurationId => 0xe4fd_83a4_ba92_11ec_8422_0242_ac12_0002,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Value handles resolved during discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicHandles([Option<u16>; CHARACTERISTIC_COUNT]);

impl CharacteristicHandles {
    /// Handle of a characteristic, if discovered
    pub fn get(&self, characteristic: Characteristic) -> Option<u16> {
        self.0[characteristic.index()]
    }

    /// Whether all six handles are known
    pub fn is_complete(&self) -> bool {
        self.0.iter().all(Option::is_some)
    }

    fn set(&mut self, characteristic: Characteristic, handle: u16) {
        self.0[characteristic.index()] = Some(handle);
    }
}

/// Index-based handle on a connection slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotHandle(usize);

impl SlotHandle {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index)
    }

    /// Slot index in the pool
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// Failure of a discovery step or a characteristic read
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// The peer did not answer in time
    #[error("characteristic request timed out")]
    Timeout,

    /// The slot holds no ready connection
    #[error("{0} is not connected")]
    NotConnected(SlotHandle),

    /// The radio stack refused the request
    #[error("radio failure: {0}")]
    Transport(String),
}

/// Advertisement seen while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Advertiser address
    pub address: MacAddress,
    /// Advertised 128-bit service UUIDs
    pub services: Vec<u128>,
    /// Signal strength
    pub rssi: i8,
}

/// Connection lifecycle notifications from the radio stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A device advertised while scanning
    DeviceFound(Advertisement),
    /// A connect attempt succeeded
    Connected {
        /// New connection
        conn: ConnHandle,
        /// Peer address
        address: MacAddress,
    },
    /// A connect attempt failed
    ConnectFailed {
        /// Peer address
        address: MacAddress,
        /// Stack reason code
        reason: u8,
    },
    /// A connection went away
    Disconnected {
        /// Lost connection
        conn: ConnHandle,
        /// Stack reason code
        reason: u8,
    },
}

/// Radio stack seen by the link manager
///
/// `discover` and `read` block for at most `timeout`.
pub trait PeerRadio {
    /// Start scanning for advertisements
    fn start_scan(&mut self) -> Result<()>;

    /// Stop scanning
    fn stop_scan(&mut self);

    /// Begin connecting to `address`; completion arrives as a [`LinkEvent`]
    fn connect(&mut self, address: &MacAddress) -> Result<()>;

    /// Abandon an outstanding connect attempt
    fn cancel_connect(&mut self, address: &MacAddress);

    /// Resolve the value handle of a characteristic
    fn discover(
        &mut self,
        conn: ConnHandle,
        characteristic: Characteristic,
        timeout: Duration,
    ) -> std::result::Result<u16, ReadError>;

    /// Read a characteristic value
    fn read(
        &mut self,
        conn: ConnHandle,
        handle: u16,
        timeout: Duration,
    ) -> std::result::Result<i32, ReadError>;

    /// Drop a connection
    fn disconnect(&mut self, conn: ConnHandle);

    /// Next pending lifecycle notification
    fn next_event(&mut self) -> Option<LinkEvent>;
}

/// State of an occupied slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Connect attempt in flight
    Connecting,
    /// Resolving characteristic handles
    CharacteristicDiscovery,
    /// Ready to be polled
    Connected,
}

/// One peer connection record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConnection {
    /// Peer address
    pub address: MacAddress,
    /// Connection handle, once connected
    pub conn: Option<ConnHandle>,
    /// Resolved characteristic handles
    pub handles: CharacteristicHandles,
    /// Slot state
    pub state: SlotState,
    /// Last poll succeeded
    pub live: bool,
}

/// Global state of the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Nothing in flight
    Idle,
    /// Scanning on behalf of a reserved slot
    Scanning {
        /// Reserved slot
        slot: SlotHandle,
    },
    /// Connect attempt in flight
    Connecting {
        /// Reserved slot
        slot: SlotHandle,
    },
    /// Resolving characteristics of a fresh connection
    CharacteristicDiscovery {
        /// Slot being resolved
        slot: SlotHandle,
    },
}

/// Outcome of handling a [`LinkEvent`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkNotice {
    /// A peer finished discovery and can be polled
    PeerReady {
        /// Its slot
        slot: SlotHandle,
        /// Its address
        address: MacAddress,
    },
    /// A slot was released; scanning may resume
    SlotFreed {
        /// The released slot
        slot: SlotHandle,
    },
}

/// Values read from one peer in one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SampleSet {
    /// Temperature (0.01 °C)
    pub temperature: i32,
    /// Humidity (0.01 %)
    pub humidity: i32,
    /// Soil moisture (0.01 %)
    pub soil_moisture: i32,
    /// Light exposure
    pub light: i32,
    /// Configured group, 0 when unset
    pub group: u8,
    /// Battery level, 0-100
    pub battery: u8,
}

impl SampleSet {
    /// Attach the peer address
    pub fn into_raw(self, mac: MacAddress) -> RawSample {
        RawSample {
            mac,
            temperature: self.temperature,
            humidity: self.humidity,
            soil_moisture: self.soil_moisture,
            light: self.light,
            battery: self.battery,
            group: self.group,
        }
    }
}

/// Bounded pool of peer connections
pub struct LinkManager<R: PeerRadio> {
    radio: R,
    slots: Vec<Option<PeerConnection>>,
    state: LinkState,
    service_uuid: u128,
    read_timeout: Duration,
    discovery_timeout: Duration,
    connect_timeout: Duration,
    connect_started: Option<Instant>,
    ever_connected: u32,
    slot_freed: bool,
}

impl<R: PeerRadio> LinkManager<R> {
    /// Create a manager from the coordinator configuration
    pub fn new(radio: R, config: &CoordinatorConfig) -> Self {
        Self {
            radio,
            slots: vec![None; config.max_peers],
            state: LinkState::Idle,
            service_uuid: config.service_uuid,
            read_timeout: config.read_timeout(),
            discovery_timeout: config.discovery_timeout(),
            connect_timeout: config.connect_timeout(),
            connect_started: None,
            ever_connected: 0,
            slot_freed: false,
        }
    }

    /// Reserve a free slot and start scanning for a peer to fill it
    ///
    /// Returns `None` when the pool is full, or when the radio refuses to
    /// scan. If a scan or connect is already in flight its slot is returned.
    pub fn start_scan(&mut self) -> Option<SlotHandle> {
        self.expire_connect();
        match self.state {
            LinkState::Scanning { slot }
            | LinkState::Connecting { slot }
            | LinkState::CharacteristicDiscovery { slot } => return Some(slot),
            LinkState::Idle => {}
        }

        let Some(index) = self.slots.iter().position(Option::is_none) else {
            debug!("Connection pool full ({} peers), not scanning", self.slots.len());
            return None;
        };
        let slot = SlotHandle(index);

        if let Err(e) = self.radio.start_scan() {
            warn!("Scan start failed: {}", e);
            return None;
        }

        debug!("Scanning for a peer for {}", slot);
        self.state = LinkState::Scanning { slot };
        Some(slot)
    }

    /// Apply one lifecycle notification
    pub fn handle_event(&mut self, event: LinkEvent) -> Option<LinkNotice> {
        match event {
            LinkEvent::DeviceFound(adv) => {
                self.on_device_found(adv);
                None
            }
            LinkEvent::Connected { conn, address } => self.on_connected(conn, address),
            LinkEvent::ConnectFailed { address, reason } => {
                let LinkState::Connecting { slot } = self.state else {
                    return None;
                };
                warn!("Connect to {} failed (reason {})", address, reason);
                self.connect_started = None;
                self.slots[slot.0] = None;
                self.state = LinkState::Idle;
                self.slot_freed = true;
                Some(LinkNotice::SlotFreed { slot })
            }
            LinkEvent::Disconnected { conn, reason } => {
                let index = self.slots.iter().position(|s| {
                    s.as_ref().and_then(|p| p.conn) == Some(conn)
                })?;
                let slot = SlotHandle(index);
                if let Some(peer) = self.slots[index].take() {
                    info!("{} disconnected from {} (reason {})", peer.address, slot, reason);
                }
                if self.state_slot() == Some(slot) {
                    self.state = LinkState::Idle;
                }
                self.slot_freed = true;
                Some(LinkNotice::SlotFreed { slot })
            }
        }
    }

    /// Drain and apply every pending radio event
    ///
    /// A connect attempt still unanswered afterwards is expired once it is
    /// older than the connect timeout.
    pub fn process_events(&mut self) -> Vec<LinkNotice> {
        let mut notices = Vec::new();
        while let Some(event) = self.radio.next_event() {
            if let Some(notice) = self.handle_event(event) {
                notices.push(notice);
            }
        }
        notices.extend(self.expire_connect());
        notices
    }

    /// Cancel the connect attempt in flight if it has outlived the connect timeout
    pub fn expire_connect(&mut self) -> Option<LinkNotice> {
        let LinkState::Connecting { slot } = self.state else {
            return None;
        };
        let started = self.connect_started?;
        if started.elapsed() < self.connect_timeout {
            return None;
        }

        if let Some(peer) = self.slots[slot.0].take() {
            warn!(
                "Connect to {} timed out after {}ms, releasing {}",
                peer.address,
                self.connect_timeout.as_millis(),
                slot
            );
            self.radio.cancel_connect(&peer.address);
        }
        self.connect_started = None;
        self.state = LinkState::Idle;
        self.slot_freed = true;
        Some(LinkNotice::SlotFreed { slot })
    }

    /// Read every characteristic of a connected peer
    ///
    /// The first failing read aborts the poll, drops the connection and frees
    /// the slot; values read before it are discarded.
    pub fn poll_peer(&mut self, slot: SlotHandle) -> std::result::Result<SampleSet, ReadError> {
        let (conn, handles) = match self.slots.get(slot.0).and_then(Option::as_ref) {
            Some(PeerConnection {
                conn: Some(conn),
                handles,
                state: SlotState::Connected,
                ..
            }) => (*conn, *handles),
            _ => return Err(ReadError::NotConnected(slot)),
        };

        let mut values = [0i32; CHARACTERISTIC_COUNT];
        for characteristic in Characteristic::ALL {
            let Some(handle) = handles.get(characteristic) else {
                return Err(ReadError::NotConnected(slot));
            };
            match self.radio.read(conn, handle, self.read_timeout) {
                Ok(value) => values[characteristic.index()] = value,
                Err(e) => {
                    warn!(
                        "Reading {:?} from {} failed: {}, releasing connection",
                        characteristic, slot, e
                    );
                    self.release(slot, conn);
                    return Err(e);
                }
            }
        }

        if let Some(peer) = self.slots[slot.0].as_mut() {
            peer.live = true;
        }

        let group = u8::try_from(values[Characteristic::ConfigurationId.index()]).unwrap_or(0);
        let battery = values[Characteristic::Battery.index()].clamp(0, 100) as u8;
        Ok(SampleSet {
            temperature: values[Characteristic::Temperature.index()],
            humidity: values[Characteristic::Humidity.index()],
            soil_moisture: values[Characteristic::SoilMoisture.index()],
            light: values[Characteristic::Light.index()],
            group,
            battery,
        })
    }

    /// Snapshot of slots ready to be polled
    pub fn connected_slots(&self) -> Vec<SlotHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, Some(p) if p.state == SlotState::Connected))
            .map(|(i, _)| SlotHandle(i))
            .collect()
    }

    /// Connection record of a slot
    pub fn peer(&self, slot: SlotHandle) -> Option<&PeerConnection> {
        self.slots.get(slot.0).and_then(Option::as_ref)
    }

    /// Whether any peer is ready to be polled
    pub fn any_connected(&self) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|p| p.state == SlotState::Connected)
    }

    /// Number of peers that completed discovery since start
    pub fn ever_connected(&self) -> u32 {
        self.ever_connected
    }

    /// Number of occupied slots
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Pool capacity
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Global manager state
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Consume the "slot freed" signal
    pub fn take_slot_freed(&mut self) -> bool {
        std::mem::take(&mut self.slot_freed)
    }

    /// Access the radio
    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    fn state_slot(&self) -> Option<SlotHandle> {
        match self.state {
            LinkState::Idle => None,
            LinkState::Scanning { slot }
            | LinkState::Connecting { slot }
            | LinkState::CharacteristicDiscovery { slot } => Some(slot),
        }
    }

    fn on_device_found(&mut self, adv: Advertisement) {
        let LinkState::Scanning { slot } = self.state else {
            return;
        };
        if !adv.services.contains(&self.service_uuid) {
            return;
        }
        if self.slots.iter().flatten().any(|p| p.address == adv.address) {
            return;
        }

        self.radio.stop_scan();
        if let Err(e) = self.radio.connect(&adv.address) {
            warn!("Connect request to {} failed: {}", adv.address, e);
            self.state = LinkState::Idle;
            return;
        }

        debug!("Connecting to {} (rssi {}) in {}", adv.address, adv.rssi, slot);
        self.slots[slot.0] = Some(PeerConnection {
            address: adv.address,
            conn: None,
            handles: CharacteristicHandles::default(),
            state: SlotState::Connecting,
            live: false,
        });
        self.connect_started = Some(Instant::now());
        self.state = LinkState::Connecting { slot };
    }

    fn on_connected(&mut self, conn: ConnHandle, address: MacAddress) -> Option<LinkNotice> {
        let slot = match self.state {
            LinkState::Connecting { slot }
                if self.slots[slot.0].as_ref().map(|p| p.address) == Some(address) =>
            {
                slot
            }
            _ => {
                warn!("Unexpected connection from {}, dropping it", address);
                self.radio.disconnect(conn);
                return None;
            }
        };

        self.connect_started = None;
        self.state = LinkState::CharacteristicDiscovery { slot };
        let mut handles = CharacteristicHandles::default();
        if let Some(peer) = self.slots[slot.0].as_mut() {
            peer.conn = Some(conn);
            peer.state = SlotState::CharacteristicDiscovery;
        }

        for characteristic in Characteristic::ALL {
            match self
                .radio
                .discover(conn, characteristic, self.discovery_timeout)
            {
                Ok(handle) => handles.set(characteristic, handle),
                Err(e) => {
                    warn!(
                        "Discovery of {:?} on {} failed: {}, abandoning peer",
                        characteristic, address, e
                    );
                    self.release(slot, conn);
                    self.state = LinkState::Idle;
                    return Some(LinkNotice::SlotFreed { slot });
                }
            }
        }

        if let Some(peer) = self.slots[slot.0].as_mut() {
            peer.handles = handles;
            peer.state = SlotState::Connected;
        }
        self.state = LinkState::Idle;
        self.ever_connected += 1;
        info!("{} connected in {}", address, slot);
        Some(LinkNotice::PeerReady { slot, address })
    }

    fn release(&mut self, slot: SlotHandle, conn: ConnHandle) {
        self.radio.disconnect(conn);
        self.slots[slot.0] = None;
        self.slot_freed = true;
    }
}
