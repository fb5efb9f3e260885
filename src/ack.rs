// AgriNet - Row-level greenhouse monitoring and control
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Acknowledged sending on the internal link
//!
//! Only one frame may be awaiting an operation result at a time. The
//! [`AckPermit`] is a binary permit: it is taken when a frame is sent and
//! given back when the peer answers that frame with a `0xFD` result. A
//! result answering any other frame type is stale and leaves the permit
//! alone. A sender that finds the permit still taken keeps draining the
//! link for up to the ack timeout, then reclaims the permit and records the
//! missing acknowledgement.

use crate::channel::{Channel, ChannelMetrics};
use crate::codec::{decode, encode};
use crate::error::Result;
use crate::protocol::{Message, MessageType, ResultCode};
use log::{debug, warn};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Default time to wait for an operation result
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(1500);

/// Longest single receive while waiting on the permit
const RECEIVE_SLICE: Duration = Duration::from_millis(1);

/// Binary permit shared between the send path and the receive path
#[derive(Debug, Default)]
pub struct AckPermit {
    taken: Mutex<bool>,
    released: Condvar,
}

impl AckPermit {
    /// Create a free permit
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the permit, waiting at most `timeout` for it to be released
    ///
    /// Returns `false` if the wait timed out; the permit is then left taken
    /// by the previous holder.
    pub fn acquire(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut taken = self.lock();
        while *taken {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            taken = match self.released.wait_timeout(taken, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *taken = true;
        true
    }

    /// Give the permit back
    pub fn release(&self) {
        *self.lock() = false;
        self.released.notify_one();
    }

    /// Whether a frame is awaiting its acknowledgement
    pub fn is_taken(&self) -> bool {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.taken.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Counters kept by an [`AckedSender`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckStats {
    /// Frames handed to the channel
    pub sent: u64,
    /// Successful operation results received
    pub acked: u64,
    /// Failure operation results received
    pub rejected: u64,
    /// Sends that found the previous frame unacknowledged
    pub timeouts: u64,
    /// Received frames that failed to decode
    pub dropped: u64,
    /// Operation results that did not answer the frame in flight
    pub stale: u64,
}

/// Sender that serialises frames behind an [`AckPermit`]
pub struct AckedSender<C: Channel> {
    channel: C,
    permit: Arc<AckPermit>,
    ack_timeout: Duration,
    awaiting: Option<MessageType>,
    stats: AckStats,
}

impl<C: Channel> AckedSender<C> {
    /// Wrap a channel with the default ack timeout
    pub fn new(channel: C) -> Self {
        Self::with_timeout(channel, DEFAULT_ACK_TIMEOUT)
    }

    /// Wrap a channel with a custom ack timeout
    pub fn with_timeout(channel: C, ack_timeout: Duration) -> Self {
        Self {
            channel,
            permit: Arc::new(AckPermit::new()),
            ack_timeout,
            awaiting: None,
            stats: AckStats::default(),
        }
    }

    /// Send one message
    ///
    /// Blocks for up to the ack timeout if the previous frame has not been
    /// acknowledged yet, receiving from the channel meanwhile. Frames other
    /// than operation results that arrive during the wait are returned to
    /// the caller.
    pub fn send(&mut self, message: &Message) -> Result<Vec<Message>> {
        let mut inbound = self.poll()?;

        if !self.await_permit(&mut inbound)? {
            self.stats.timeouts += 1;
            warn!(
                "No operation result for {:?} within {}ms, reclaiming permit",
                self.awaiting,
                self.ack_timeout.as_millis()
            );
            self.awaiting = None;
        }

        let msg_type = message.message_type();
        if let Err(e) = self.channel.send(encode(message)) {
            self.permit.release();
            self.awaiting = None;
            return Err(e);
        }
        self.awaiting = Some(msg_type);
        self.stats.sent += 1;
        debug!("Sent {}", msg_type);

        Ok(inbound)
    }

    /// Drain received frames, releasing the permit on operation results
    ///
    /// Returns every other successfully decoded message.
    pub fn poll(&mut self) -> Result<Vec<Message>> {
        let mut inbound = Vec::new();
        loop {
            let frame = match self.channel.receive(Duration::ZERO) {
                Ok(frame) => frame,
                Err(e) if e.is_timeout() => break,
                Err(e) => return Err(e),
            };
            if let Some(message) = self.on_frame(&frame) {
                inbound.push(message);
            }
        }
        Ok(inbound)
    }

    /// Process one received frame
    ///
    /// Operation results release the permit and are consumed here.
    pub fn on_frame(&mut self, frame: &[u8]) -> Option<Message> {
        match decode(frame) {
            Ok(Message::OperationResult(code)) => {
                self.record_result(code);
                None
            }
            Ok(message) => Some(message),
            Err(e) => {
                self.stats.dropped += 1;
                warn!("Dropping frame from internal link: {}", e);
                None
            }
        }
    }

    /// Shared handle on the permit
    pub fn permit(&self) -> Arc<AckPermit> {
        Arc::clone(&self.permit)
    }

    /// Sender counters
    pub fn stats(&self) -> &AckStats {
        &self.stats
    }

    /// Metrics of the wrapped channel
    pub fn channel_metrics(&self) -> ChannelMetrics {
        self.channel.metrics()
    }

    /// Access the wrapped channel
    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Unwrap the channel
    pub fn into_inner(self) -> C {
        self.channel
    }

    /// The frame in flight, if any
    pub fn awaiting(&self) -> Option<MessageType> {
        self.awaiting
    }

    /// Take the permit, receiving until it is released or the ack timeout runs out
    fn await_permit(&mut self, inbound: &mut Vec<Message>) -> Result<bool> {
        let deadline = Instant::now() + self.ack_timeout;
        loop {
            if self.permit.acquire(Duration::ZERO) {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let slice = (deadline - now).min(RECEIVE_SLICE);
            match self.channel.receive(slice) {
                Ok(frame) => {
                    if let Some(message) = self.on_frame(&frame) {
                        inbound.push(message);
                    }
                }
                // Nothing on the link; the permit may still be released
                // through a shared handle.
                Err(e) if e.is_timeout() => {
                    if self.permit.acquire(slice) {
                        return Ok(true);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn record_result(&mut self, code: ResultCode) {
        let awaiting = match self.awaiting {
            Some(msg_type) if code.answers(msg_type) => msg_type,
            other => {
                self.stats.stale += 1;
                warn!("Stale operation result {} while awaiting {:?}, ignored", code, other);
                return;
            }
        };
        if code.is_success() {
            self.stats.acked += 1;
            debug!("Operation result {} for {}", code, awaiting);
        } else {
            self.stats.rejected += 1;
            warn!("Relay rejected {} with {}", awaiting, code);
        }
        self.awaiting = None;
        self.permit.release();
    }
}
