// AgriNet - Row-level greenhouse monitoring and control
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Channel abstraction module
//!
//! This module provides the trait and in-memory implementations for the
//! internal link between a coordinator and its relay. A channel carries
//! complete frames; byte-stream transports reassemble them with
//! [`crate::codec::FrameAssembler`] before handing them over.

use crate::error::{ChannelError, Result};
use std::collections::VecDeque;
use std::time::Duration;

/// One encoded frame
pub type Frame = Vec<u8>;

/// Statistics about channel usage
#[derive(Debug, Clone, Default)]
pub struct ChannelMetrics {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total frames sent
    pub frames_sent: u64,
    /// Total frames received
    pub frames_received: u64,
    /// Frames lost in transit (simulated links only)
    pub frames_lost: u64,
}

/// Trait for frame channels
pub trait Channel {
    /// Send a frame through the channel
    fn send(&mut self, frame: Frame) -> Result<()>;

    /// Receive a frame, waiting at most `timeout`
    fn receive(&mut self, timeout: Duration) -> Result<Frame>;

    /// Check if the channel is available
    fn is_available(&self) -> bool;

    /// Get channel metrics
    fn metrics(&self) -> ChannelMetrics;

    /// Close the channel
    fn close(&mut self);
}

/// A simple in-memory channel for testing and local communication
#[derive(Debug)]
pub struct MemoryChannel {
    tx_buffer: VecDeque<Frame>,
    rx_buffer: VecDeque<Frame>,
    max_buffer_size: usize,
    is_open: bool,
    metrics: ChannelMetrics,
}

impl MemoryChannel {
    /// Create a new memory channel
    pub fn new() -> Self {
        Self::with_buffer_size(256)
    }

    /// Create with custom buffer size
    pub fn with_buffer_size(max_size: usize) -> Self {
        Self {
            tx_buffer: VecDeque::with_capacity(max_size),
            rx_buffer: VecDeque::with_capacity(max_size),
            max_buffer_size: max_size,
            is_open: true,
            metrics: ChannelMetrics::default(),
        }
    }

    /// Push a frame to the receive buffer (simulate receiving)
    pub fn push_incoming(&mut self, frame: Frame) {
        self.rx_buffer.push_back(frame);
    }

    /// Pop a frame from the send buffer (simulate transmission)
    pub fn pop_outgoing(&mut self) -> Option<Frame> {
        self.tx_buffer.pop_front()
    }

    /// Drain every pending outgoing frame
    pub fn drain_outgoing(&mut self) -> Vec<Frame> {
        self.tx_buffer.drain(..).collect()
    }

    /// Get number of pending outgoing frames
    pub fn pending_outgoing(&self) -> usize {
        self.tx_buffer.len()
    }

    /// Get number of pending incoming frames
    pub fn pending_incoming(&self) -> usize {
        self.rx_buffer.len()
    }

    /// Transfer all frames from this channel's TX to another channel's RX
    pub fn transfer_to(&mut self, other: &mut MemoryChannel) {
        while let Some(frame) = self.tx_buffer.pop_front() {
            other.rx_buffer.push_back(frame);
        }
    }

    fn closed_error() -> ChannelError {
        ChannelError::Disconnected {
            reason: "Channel is closed".to_string(),
        }
    }
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for MemoryChannel {
    fn send(&mut self, frame: Frame) -> Result<()> {
        if !self.is_open {
            return Err(Self::closed_error().into());
        }

        if self.tx_buffer.len() >= self.max_buffer_size {
            return Err(ChannelError::BufferFull.into());
        }

        self.metrics.bytes_sent += frame.len() as u64;
        self.metrics.frames_sent += 1;
        self.tx_buffer.push_back(frame);

        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Frame> {
        if !self.is_open {
            return Err(Self::closed_error().into());
        }

        match self.rx_buffer.pop_front() {
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
        self.is_open
    }

    fn metrics(&self) -> ChannelMetrics {
        self.metrics.clone()
    }

    fn close(&mut self) {
        self.is_open = false;
    }
}

/// Both ends of a coordinator <-> relay link
#[derive(Debug, Default)]
pub struct ChannelPair {
    /// Coordinator side
    pub coordinator: MemoryChannel,
    /// Relay side
    pub relay: MemoryChannel,
}

impl ChannelPair {
    /// Create a new channel pair
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the wire: deliver everything sent by either side
    pub fn transfer(&mut self) {
        self.coordinator.transfer_to(&mut self.relay);
        self.relay.transfer_to(&mut self.coordinator);
    }
}

/// Lossy channel that simulates frame loss
#[derive(Debug)]
pub struct LossyChannel {
    inner: MemoryChannel,
    loss_rate: f32,
    rng_state: u64,
}

impl LossyChannel {
    /// Create a new lossy channel with given loss rate (0.0-1.0)
    pub fn new(loss_rate: f32) -> Self {
        Self {
            inner: MemoryChannel::new(),
            loss_rate: loss_rate.clamp(0.0, 1.0),
            rng_state: 12345,
        }
    }

    /// Access the wrapped channel
    pub fn inner_mut(&mut self) -> &mut MemoryChannel {
        &mut self.inner
    }

    /// Simple PRNG for deterministic testing
    fn next_random(&mut self) -> f32 {
        self.rng_state = self.rng_state.wrapping_mul(1103515245).wrapping_add(12345);
        ((self.rng_state >> 16) & 0x7fff) as f32 / 32767.0
    }
}

impl Channel for LossyChannel {
    fn send(&mut self, frame: Frame) -> Result<()> {
        if self.next_random() < self.loss_rate {
            self.inner.metrics.bytes_sent += frame.len() as u64;
            self.inner.metrics.frames_sent += 1;
            self.inner.metrics.frames_lost += 1;
            return Ok(());
        }
        self.inner.send(frame)
    }

    fn receive(&mut self, timeout: Duration) -> Result<Frame> {
        self.inner.receive(timeout)
    }

    fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    fn metrics(&self) -> ChannelMetrics {
        self.inner.metrics()
    }

    fn close(&mut self) {
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use crate::protocol::Message;

    #[test]
    fn test_memory_channel_send_receive() {
        let mut channel = MemoryChannel::new();
        channel.send(encode(&Message::ReadyToRelay)).unwrap();
        assert_eq!(channel.pending_outgoing(), 1);

        let frame = channel.pop_outgoing().unwrap();
        channel.push_incoming(frame.clone());
        assert_eq!(channel.receive(Duration::from_millis(10)).unwrap(), frame);

        let metrics = channel.metrics();
        assert_eq!(metrics.frames_sent, 1);
        assert_eq!(metrics.frames_received, 1);
        assert_eq!(metrics.bytes_sent, 4);
    }

    #[test]
    fn test_memory_channel_timeout() {
        let mut channel = MemoryChannel::new();
        let err = channel.receive(Duration::from_millis(1500)).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_memory_channel_closed() {
        let mut channel = MemoryChannel::new();
        channel.close();
        assert!(!channel.is_available());
        assert!(channel.send(vec![0xC0]).is_err());
    }

    #[test]
    fn test_memory_channel_buffer_full() {
        let mut channel = MemoryChannel::with_buffer_size(2);
        channel.send(vec![1]).unwrap();
        channel.send(vec![2]).unwrap();
        assert!(channel.send(vec![3]).is_err());
    }

    #[test]
    fn test_channel_pair_transfer() {
        let mut pair = ChannelPair::new();
        pair.coordinator.send(vec![0x83, 4, 0, 0]).unwrap();
        pair.relay.send(vec![0xFD]).unwrap();
        pair.transfer();

        assert_eq!(pair.relay.pending_incoming(), 1);
        assert_eq!(pair.coordinator.pending_incoming(), 1);
    }

    #[test]
    fn test_lossy_channel() {
        let mut channel = LossyChannel::new(0.5);
        for i in 0..100u8 {
            channel.send(vec![i]).unwrap();
        }
        let metrics = channel.metrics();
        assert_eq!(metrics.frames_sent, 100);
        assert!(metrics.frames_lost > 20 && metrics.frames_lost < 80);
        assert_eq!(
            channel.inner_mut().pending_outgoing() as u64,
            100 - metrics.frames_lost
        );
    }
}
