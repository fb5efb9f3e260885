// AgriNet Coordinator - Cross-link orchestration layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Simulated sensor field
//!
//! A [`PeerRadio`] backed by in-memory peers. Used by the tests and by the
//! host daemon when no radio hardware is present.

use crate::config::MEASUREMENT_SERVICE_UUID;
use crate::error::{CoordinatorError, Result};
use crate::link::{
    Advertisement, Characteristic, ConnHandle, LinkEvent, PeerRadio, ReadError,
    CHARACTERISTIC_COUNT,
};
use agrinet::MacAddress;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Reason code reported when the local side closes a connection
const REASON_LOCAL_HOST: u8 = 0x16;
/// Reason code reported when the peer disappears
const REASON_REMOTE_USER: u8 = 0x13;
/// Reason code of a refused connection
const REASON_REFUSED: u8 = 0x3e;

/// One simulated sensor peer
#[derive(Debug, Clone, PartialEq)]
pub struct SimPeer {
    /// Peer address
    pub address: MacAddress,
    /// Advertised services
    pub services: Vec<u128>,
    /// Values served per characteristic, in [`Characteristic::ALL`] order
    pub values: [i32; CHARACTERISTIC_COUNT],
    /// Answers reads
    pub responsive: bool,
    /// Characteristics missing from its GATT table
    pub missing: Vec<Characteristic>,
    /// Rejects connect attempts
    pub refuses: bool,
    /// Never completes a connect attempt
    pub silent: bool,
}

impl SimPeer {
    /// Peer `id` configured for `group`, with mid-range readings
    pub fn new(id: u8, group: u8) -> Self {
        Self {
            address: MacAddress::from_octets([0xd4, 0x3a, 0x2c, 0x00, 0x00, id]),
            services: vec![MEASUREMENT_SERVICE_UUID],
            values: [2400, 6000, 5000, 200, group as i32, 100],
            responsive: true,
            missing: Vec::new(),
            refuses: false,
            silent: false,
        }
    }

    /// Set temperature, humidity, soil moisture and light
    pub fn with_readings(mut self, temperature: i32, humidity: i32, soil: i32, light: i32) -> Self {
        self.values[0] = temperature;
        self.values[1] = humidity;
        self.values[2] = soil;
        self.values[3] = light;
        self
    }

    /// Set the battery level
    pub fn with_battery(mut self, battery: i32) -> Self {
        self.values[5] = battery;
        self
    }

    /// Serve a raw configuration id value
    pub fn with_group_value(mut self, value: i32) -> Self {
        self.values[4] = value;
        self
    }

    /// Replace the advertised services
    pub fn with_services(mut self, services: Vec<u128>) -> Self {
        self.services = services;
        self
    }

    /// Remove a characteristic so its discovery times out
    pub fn without_characteristic(mut self, characteristic: Characteristic) -> Self {
        self.missing.push(characteristic);
        self
    }

    /// Refuse every connect attempt
    pub fn refusing_connections(mut self) -> Self {
        self.refuses = true;
        self
    }

    /// Accept connect requests but never report their outcome
    pub fn silent_on_connect(mut self) -> Self {
        self.silent = true;
        self
    }
}

/// In-memory radio serving [`SimPeer`]s
#[derive(Debug, Default)]
pub struct SimulatedRadio {
    peers: Vec<SimPeer>,
    connections: HashMap<ConnHandle, MacAddress>,
    events: VecDeque<LinkEvent>,
    scanning: bool,
    next_conn: ConnHandle,
    pending_connect: Option<MacAddress>,
    fail_scan: bool,
    reads: u64,
}

impl SimulatedRadio {
    /// Empty field
    pub fn new() -> Self {
        Self {
            next_conn: 1,
            ..Default::default()
        }
    }

    /// Field of `count` peers spread round-robin over `groups` groups
    ///
    /// Peer ids are the last address octet, so a field holds at most 255 peers.
    pub fn with_field(count: u8, groups: u8) -> Self {
        let mut radio = Self::new();
        for i in 0..count {
            let group = i % groups.max(1) + 1;
            let offset = i as i32 * 25;
            radio.add_peer(
                SimPeer::new(i + 1, group)
                    .with_readings(2200 + offset, 6000 + offset, 5000 - offset, 150 + offset)
                    .with_battery(100 - i as i32),
            );
        }
        radio
    }

    /// Add a peer to the field
    pub fn add_peer(&mut self, peer: SimPeer) {
        if self.scanning {
            self.events.push_back(Self::advertisement(&peer));
        }
        self.peers.push(peer);
    }

    /// Make a peer stop (or resume) answering reads
    pub fn set_responsive(&mut self, address: &MacAddress, responsive: bool) {
        if let Some(peer) = self.peer_mut(address) {
            peer.responsive = responsive;
        }
    }

    /// Update the readings a peer serves
    pub fn set_readings(&mut self, address: &MacAddress, temperature: i32, humidity: i32, soil: i32, light: i32) {
        if let Some(peer) = self.peer_mut(address) {
            peer.values[0] = temperature;
            peer.values[1] = humidity;
            peer.values[2] = soil;
            peer.values[3] = light;
        }
    }

    /// Remove a peer; an open connection to it is reported as lost
    pub fn drop_peer(&mut self, address: &MacAddress) {
        self.peers.retain(|p| &p.address != address);
        let lost: Vec<ConnHandle> = self
            .connections
            .iter()
            .filter(|(_, a)| *a == address)
            .map(|(c, _)| *c)
            .collect();
        for conn in lost {
            self.connections.remove(&conn);
            self.events.push_back(LinkEvent::Disconnected {
                conn,
                reason: REASON_REMOTE_USER,
            });
        }
    }

    /// Make the next scan requests fail
    pub fn fail_scans(&mut self, fail: bool) {
        self.fail_scan = fail;
    }

    /// Number of characteristic reads served
    pub fn reads(&self) -> u64 {
        self.reads
    }

    /// Peer addresses in the field
    pub fn addresses(&self) -> Vec<MacAddress> {
        self.peers.iter().map(|p| p.address).collect()
    }

    /// Address of a connect attempt that has not completed
    pub fn pending_connect(&self) -> Option<MacAddress> {
        self.pending_connect
    }

    fn peer_mut(&mut self, address: &MacAddress) -> Option<&mut SimPeer> {
        self.peers.iter_mut().find(|p| &p.address == address)
    }

    fn connected_peer(&self, conn: ConnHandle) -> Option<&SimPeer> {
        let address = self.connections.get(&conn)?;
        self.peers.iter().find(|p| &p.address == address)
    }

    fn advertisement(peer: &SimPeer) -> LinkEvent {
        LinkEvent::DeviceFound(Advertisement {
            address: peer.address,
            services: peer.services.clone(),
            rssi: -60,
        })
    }
}

impl PeerRadio for SimulatedRadio {
    fn start_scan(&mut self) -> Result<()> {
        if self.fail_scan {
            return Err(CoordinatorError::Transport("scan refused".to_string()));
        }
        self.scanning = true;
        let connected: Vec<MacAddress> = self.connections.values().copied().collect();
        for peer in &self.peers {
            if !connected.contains(&peer.address) {
                self.events.push_back(Self::advertisement(peer));
            }
        }
        Ok(())
    }

    fn stop_scan(&mut self) {
        self.scanning = false;
        self.events
            .retain(|e| !matches!(e, LinkEvent::DeviceFound(_)));
    }

    fn connect(&mut self, address: &MacAddress) -> Result<()> {
        let Some(peer) = self.peers.iter().find(|p| &p.address == address) else {
            return Err(CoordinatorError::Transport(format!("{} not in range", address)));
        };
        if peer.refuses {
            self.events.push_back(LinkEvent::ConnectFailed {
                address: *address,
                reason: REASON_REFUSED,
            });
            return Ok(());
        }
        if peer.silent {
            self.pending_connect = Some(*address);
            return Ok(());
        }
        let conn = self.next_conn;
        self.next_conn = self.next_conn.wrapping_add(1).max(1);
        self.connections.insert(conn, *address);
        self.events.push_back(LinkEvent::Connected {
            conn,
            address: *address,
        });
        Ok(())
    }

    fn cancel_connect(&mut self, address: &MacAddress) {
        if self.pending_connect.as_ref() == Some(address) {
            self.pending_connect = None;
        }
    }

    fn discover(
        &mut self,
        conn: ConnHandle,
        characteristic: Characteristic,
        _timeout: Duration,
    ) -> std::result::Result<u16, ReadError> {
        let peer = self
            .connected_peer(conn)
            .ok_or_else(|| ReadError::Transport(format!("unknown connection {}", conn)))?;
        if peer.missing.contains(&characteristic) {
            return Err(ReadError::Timeout);
        }
        Ok(0x0010 + characteristic as u16 * 3)
    }

    fn read(
        &mut self,
        conn: ConnHandle,
        handle: u16,
        _timeout: Duration,
    ) -> std::result::Result<i32, ReadError> {
        let peer = self
            .connected_peer(conn)
            .ok_or_else(|| ReadError::Transport(format!("unknown connection {}", conn)))?;
        if !peer.responsive {
            return Err(ReadError::Timeout);
        }
        let index = handle.checked_sub(0x0010).map(|h| (h / 3) as usize);
        let value = index
            .and_then(|i| peer.values.get(i).copied())
            .ok_or_else(|| ReadError::Transport(format!("bad handle 0x{:04x}", handle)))?;
        self.reads += 1;
        Ok(value)
    }

    fn disconnect(&mut self, conn: ConnHandle) {
        if self.connections.remove(&conn).is_some() {
            self.events.push_back(LinkEvent::Disconnected {
                conn,
                reason: REASON_LOCAL_HOST,
            });
        }
    }

    fn next_event(&mut self) -> Option<LinkEvent> {
        self.events.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_advertises_unconnected_peers() {
        let mut radio = SimulatedRadio::with_field(3, 2);
        radio.start_scan().unwrap();
        let mut found = 0;
        while let Some(event) = radio.next_event() {
            assert!(matches!(event, LinkEvent::DeviceFound(_)));
            found += 1;
        }
        assert_eq!(found, 3);
    }

    #[test]
    fn test_field_groups_round_robin() {
        let radio = SimulatedRadio::with_field(5, 2);
        let groups: Vec<i32> = radio.peers.iter().map(|p| p.values[4]).collect();
        assert_eq!(groups, vec![1, 2, 1, 2, 1]);
    }

    #[test]
    fn test_field_of_255_peers_has_distinct_addresses() {
        let radio = SimulatedRadio::with_field(u8::MAX, 3);
        let distinct: std::collections::HashSet<MacAddress> =
            radio.addresses().into_iter().collect();
        assert_eq!(distinct.len(), 255);
    }

    #[test]
    fn test_read_after_disconnect_fails() {
        let mut radio = SimulatedRadio::new();
        let peer = SimPeer::new(9, 1);
        let address = peer.address;
        radio.add_peer(peer);
        radio.connect(&address).unwrap();
        let Some(LinkEvent::Connected { conn, .. }) = radio.next_event() else {
            panic!("no connection event");
        };

        let handle = radio
            .discover(conn, Characteristic::Light, Duration::ZERO)
            .unwrap();
        assert_eq!(radio.read(conn, handle, Duration::ZERO), Ok(200));

        radio.disconnect(conn);
        assert!(radio.read(conn, handle, Duration::ZERO).is_err());
    }
}
