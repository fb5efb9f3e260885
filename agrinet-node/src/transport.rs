// AgriNet Node - Host daemon for a coordinator and relay pair
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! UDP transport to the CoAP collector

use agrinet_coordinator::{CoordinatorError, Result, WanTransport};
use std::io::ErrorKind;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Largest datagram accepted from the collector
const MAX_DATAGRAM: usize = 1152;

/// Connected UDP socket toward one collector
pub struct UdpTransport {
    server: String,
    socket: Mutex<Option<UdpSocket>>,
}

impl UdpTransport {
    /// Transport to `server` (`host:port`), opened lazily
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            socket: Mutex::new(None),
        }
    }

    fn socket(&self) -> MutexGuard<'_, Option<UdpSocket>> {
        self.socket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl WanTransport for UdpTransport {
    fn is_connected(&self) -> bool {
        self.server
            .as_str()
            .to_socket_addrs()
            .map(|mut addrs| addrs.next().is_some())
            .unwrap_or(false)
    }

    fn open(&self) -> Result<()> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(self.server.as_str())?;
        socket.set_nonblocking(true)?;
        debug!(local = ?socket.local_addr().ok(), server = %self.server, "UDP socket open");
        *self.socket() = Some(socket);
        Ok(())
    }

    fn send(&self, datagram: &[u8]) -> Result<()> {
        let guard = self.socket();
        let socket = guard
            .as_ref()
            .ok_or_else(|| CoordinatorError::Transport("session not open".to_string()))?;
        socket.send(datagram)?;
        Ok(())
    }

    fn try_recv(&self) -> Result<Option<Vec<u8>>> {
        let guard = self.socket();
        let Some(socket) = guard.as_ref() else {
            return Ok(None);
        };
        let mut buf = [0u8; MAX_DATAGRAM];
        match socket.recv(&mut buf) {
            Ok(n) => Ok(Some(buf[..n].to_vec())),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            // ICMP unreachable from an earlier send
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                debug!("Collector unreachable: {}", e);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_send_before_open_fails() {
        let transport = UdpTransport::new("127.0.0.1:5683");
        assert!(transport.send(&[0x40]).is_err());
        assert_eq!(transport.try_recv().unwrap(), None);
    }

    #[test]
    fn test_unresolvable_server_is_disconnected() {
        let transport = UdpTransport::new("not an address");
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_datagram_exchange() {
        let collector = UdpSocket::bind("127.0.0.1:0").unwrap();
        collector
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let transport = UdpTransport::new(collector.local_addr().unwrap().to_string());
        assert!(transport.is_connected());
        transport.open().unwrap();
        transport.send(&[0x50, 0x03, 0x00, 0x01]).unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = collector.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x50, 0x03, 0x00, 0x01]);

        collector.send_to(&[0x60, 0x44], from).unwrap();
        let mut received = None;
        for _ in 0..200 {
            if let Some(datagram) = transport.try_recv().unwrap() {
                received = Some(datagram);
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(received, Some(vec![0x60, 0x44]));
    }
}
