// AgriNet - Row-level greenhouse monitoring and control
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Binary message codec
//!
//! Encodes and validates the fixed-layout frames described in
//! [`crate::protocol`]. Both directions are pure transforms.
//!
//! The checksum is CRC-16/MODBUS (reflected polynomial 0xA001, initial value
//! 0xFFFF) over every byte before the CRC field, stored little-endian.

use crate::error::DecodeError;
use crate::protocol::{
    ActuatorCommand, ActuatorState, CloudAggregate, ControlUpdate, GroupAggregate, MacAddress,
    Message, MessageType, RawSample, ResultCode, ThresholdUpdate, CRC_SIZE, HEADER_SIZE,
    MAC_ADDRESS_LEN, MAX_FRAME_SIZE, MIN_FRAME_SIZE,
};
use crc::{Crc, CRC_16_MODBUS};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Compute the frame checksum over `data`
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Encode a message into a complete frame
pub fn encode(message: &Message) -> Vec<u8> {
    let msg_type = message.message_type();
    let mut w = FrameWriter::new(msg_type);

    match message {
        Message::RawSample(s) => {
            w.bytes(s.mac.as_bytes());
            w.i32(s.temperature);
            w.i32(s.humidity);
            w.i32(s.soil_moisture);
            w.i32(s.light);
            w.u8(s.battery);
            w.u8(s.group);
        }
        Message::GroupAggregate(a) => {
            w.i16(a.temperature);
            w.i16(a.humidity);
            w.i16(a.soil_moisture);
            w.i16(a.light);
            w.bool(a.actuators.fan);
            w.bool(a.actuators.water);
            w.bool(a.actuators.light);
            w.bool(a.registered);
            w.u8(a.group);
        }
        Message::OperationResult(code) => w.u16(code.0),
        Message::ReadyToRelay | Message::TimestampSync => {}
        Message::ActuatorCommand(cmd) => {
            for g in &cmd.groups {
                w.bool(g.fan);
            }
            for g in &cmd.groups {
                w.bool(g.water);
            }
            for g in &cmd.groups {
                w.bool(g.light);
            }
        }
        Message::CloudAggregate(c) => {
            w.i16(c.temperature);
            w.u16(c.humidity);
            w.u16(c.soil_moisture);
            w.u16(c.light);
            w.u8(c.group);
            w.i64(c.timestamp_ms);
            w.bool(c.actuators.light);
            w.bool(c.actuators.water);
            w.bool(c.actuators.fan);
        }
        Message::ControlUpdate(u) => {
            w.u8(u.group);
            w.bool(u.automatic);
            w.bool(u.switches.light);
            w.bool(u.switches.water);
            w.bool(u.switches.fan);
        }
        Message::ThresholdUpdate(t) => {
            w.u8(t.group);
            w.i16(t.temperature);
            w.u16(t.humidity);
            w.u16(t.light);
            w.u16(t.soil_moisture);
        }
    }

    w.finish()
}

/// Decode and validate one frame
///
/// The buffer may be longer than the frame; trailing bytes are ignored.
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    let msg_type = peek_type(bytes)?;
    let expected = msg_type.frame_len();

    if bytes.len() < HEADER_SIZE {
        return Err(DecodeError::BufferTooShort {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }
    let declared = bytes[1] as usize;
    if declared != expected {
        return Err(DecodeError::LengthMismatch {
            msg_type: msg_type as u8,
            declared,
            expected,
        });
    }
    if bytes.len() < expected {
        return Err(DecodeError::BufferTooShort {
            needed: expected,
            available: bytes.len(),
        });
    }

    let frame = &bytes[..expected];
    let body_len = expected - CRC_SIZE;
    let actual = crc16(&frame[..body_len]);
    let stored = u16::from_le_bytes([frame[body_len], frame[body_len + 1]]);
    if stored != actual {
        return Err(DecodeError::CrcMismatch {
            expected: stored,
            actual,
        });
    }

    let mut r = FrameReader::new(&frame[..body_len]);
    let message = match msg_type {
        MessageType::RawSample => {
            let offset = r.pos;
            let mac = MacAddress::from_bytes(r.array::<MAC_ADDRESS_LEN>())
                .ok_or(DecodeError::InvalidField { field: "mac", offset })?;
            Message::RawSample(RawSample {
                mac,
                temperature: r.i32(),
                humidity: r.i32(),
                soil_moisture: r.i32(),
                light: r.i32(),
                battery: r.u8(),
                group: r.u8(),
            })
        }
        MessageType::GroupAggregate => {
            let temperature = r.i16();
            let humidity = r.i16();
            let soil_moisture = r.i16();
            let light = r.i16();
            let actuators = ActuatorState {
                fan: r.bool(),
                water: r.bool(),
                light: r.bool(),
            };
            Message::GroupAggregate(GroupAggregate {
                temperature,
                humidity,
                soil_moisture,
                light,
                actuators,
                registered: r.bool(),
                group: r.u8(),
            })
        }
        MessageType::OperationResult => Message::OperationResult(ResultCode(r.u16())),
        MessageType::ReadyToRelay => Message::ReadyToRelay,
        MessageType::TimestampSync => Message::TimestampSync,
        MessageType::ActuatorCommand => {
            let mut cmd = ActuatorCommand::default();
            for g in cmd.groups.iter_mut() {
                g.fan = r.bool();
            }
            for g in cmd.groups.iter_mut() {
                g.water = r.bool();
            }
            for g in cmd.groups.iter_mut() {
                g.light = r.bool();
            }
            Message::ActuatorCommand(cmd)
        }
        MessageType::CloudAggregate => {
            let temperature = r.i16();
            let humidity = r.u16();
            let soil_moisture = r.u16();
            let light = r.u16();
            let group = r.u8();
            let timestamp_ms = r.i64();
            let light_on = r.bool();
            let water = r.bool();
            let fan = r.bool();
            Message::CloudAggregate(CloudAggregate {
                group,
                temperature,
                humidity,
                soil_moisture,
                light,
                timestamp_ms,
                actuators: ActuatorState {
                    fan,
                    water,
                    light: light_on,
                },
            })
        }
        MessageType::ControlUpdate => {
            let group = r.u8();
            let automatic = r.bool();
            let light = r.bool();
            let water = r.bool();
            let fan = r.bool();
            Message::ControlUpdate(ControlUpdate {
                group,
                automatic,
                switches: ActuatorState { fan, water, light },
            })
        }
        MessageType::ThresholdUpdate => Message::ThresholdUpdate(ThresholdUpdate {
            group: r.u8(),
            temperature: r.i16(),
            humidity: r.u16(),
            light: r.u16(),
            soil_moisture: r.u16(),
        }),
    };

    Ok(message)
}

/// Read the type byte of a frame without validating the rest
pub fn peek_type(bytes: &[u8]) -> Result<MessageType, DecodeError> {
    let first = *bytes.first().ok_or(DecodeError::BufferTooShort {
        needed: MIN_FRAME_SIZE,
        available: 0,
    })?;
    MessageType::from_u8(first).ok_or(DecodeError::UnknownType(first))
}

/// Frame builder; appends the CRC on `finish`
struct FrameWriter {
    buf: Vec<u8>,
}

impl FrameWriter {
    fn new(msg_type: MessageType) -> Self {
        let len = msg_type.frame_len();
        let mut buf = Vec::with_capacity(len);
        buf.push(msg_type as u8);
        buf.push(len as u8);
        Self { buf }
    }

    fn bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn finish(mut self) -> Vec<u8> {
        let crc = crc16(&self.buf);
        self.buf.extend_from_slice(&crc.to_le_bytes());
        self.buf
    }
}

/// Cursor over a frame body whose length was already checked
struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn new(frame: &'a [u8]) -> Self {
        Self {
            buf: frame,
            pos: HEADER_SIZE,
        }
    }

    fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u8(&mut self) -> u8 {
        self.array::<1>()[0]
    }

    fn bool(&mut self) -> bool {
        self.u8() != 0
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.array())
    }

    fn i16(&mut self) -> i16 {
        i16::from_le_bytes(self.array())
    }

    fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.array())
    }

    fn i64(&mut self) -> i64 {
        i64::from_le_bytes(self.array())
    }
}

/// Reassembles frames from a byte stream
///
/// Serial links deliver bytes in arbitrary chunks. The assembler waits for a
/// known type byte, reads the total length from the second byte and emits the
/// frame once that many bytes are buffered. Garbage before a type byte and
/// impossible lengths are skipped one byte at a time.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: Vec<u8>,
    /// Start of unconsumed bytes in `buf`, zero between calls to `push`
    start: usize,
    dropped: u64,
}

impl FrameAssembler {
    /// Create an empty assembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed received bytes, returning every frame completed by them
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            let pending = &self.buf[self.start..];
            let Some(&first) = pending.first() else {
                break;
            };
            if MessageType::from_u8(first).is_none() {
                self.skip_byte();
                continue;
            }
            let Some(&len) = pending.get(1) else {
                break;
            };
            let len = len as usize;
            if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&len) {
                self.skip_byte();
                continue;
            }
            if pending.len() < len {
                break;
            }
            frames.push(pending[..len].to_vec());
            self.start += len;
        }

        self.buf.drain(..self.start);
        self.start = 0;
        frames
    }

    /// Bytes discarded while resynchronising
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped
    }

    /// Bytes buffered for an incomplete frame
    pub fn pending(&self) -> usize {
        self.buf.len() - self.start
    }

    /// Discard any partial frame
    pub fn reset(&mut self) {
        self.buf.clear();
        self.start = 0;
    }

    fn skip_byte(&mut self) {
        self.start += 1;
        self.dropped += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RawSample {
        RawSample {
            mac: MacAddress::from_octets([0xc0, 0xff, 0xee, 0x00, 0x00, 0x07]),
            temperature: 2345,
            humidity: 6120,
            soil_moisture: 4410,
            light: 870,
            battery: 93,
            group: 2,
        }
    }

    fn all_messages() -> Vec<Message> {
        let mut cmd = ActuatorCommand::default();
        cmd.groups[0] = ActuatorState {
            fan: true,
            water: false,
            light: true,
        };
        cmd.groups[4].water = true;

        vec![
            Message::RawSample(sample()),
            Message::GroupAggregate(GroupAggregate {
                group: 3,
                temperature: -150,
                humidity: 7000,
                soil_moisture: 5999,
                light: 100,
                actuators: ActuatorState {
                    fan: true,
                    water: true,
                    light: false,
                },
                registered: true,
            }),
            Message::OperationResult(ResultCode::GROUP_MEAN_OK),
            Message::ReadyToRelay,
            Message::ActuatorCommand(cmd),
            Message::TimestampSync,
            Message::CloudAggregate(CloudAggregate {
                group: 1,
                temperature: 2250,
                humidity: 6500,
                soil_moisture: 3000,
                light: 250,
                timestamp_ms: 1_735_689_600_000,
                actuators: ActuatorState {
                    fan: false,
                    water: true,
                    light: true,
                },
            }),
            Message::ControlUpdate(ControlUpdate {
                group: 4,
                automatic: false,
                switches: ActuatorState {
                    fan: true,
                    water: false,
                    light: true,
                },
            }),
            Message::ThresholdUpdate(ThresholdUpdate {
                group: 5,
                temperature: 3000,
                humidity: 8000,
                light: 120,
                soil_moisture: 5500,
            }),
        ]
    }

    #[test]
    fn test_crc_check_value() {
        // CRC-16/MODBUS check value
        assert_eq!(crc16(b"123456789"), 0x4B37);
    }

    #[test]
    fn test_roundtrip_every_type() {
        for message in all_messages() {
            let frame = encode(&message);
            assert_eq!(frame.len(), message.message_type().frame_len());
            assert_eq!(frame[1] as usize, frame.len());
            assert_eq!(decode(&frame).unwrap(), message);
        }
    }

    #[test]
    fn test_layout_raw_sample() {
        let frame = encode(&Message::RawSample(sample()));
        assert_eq!(frame[0], 0xA1);
        assert_eq!(frame[1], 39);
        assert_eq!(&frame[2..19], b"C0:FF:EE:00:00:07");
        assert_eq!(&frame[19..23], &2345i32.to_le_bytes());
        assert_eq!(frame[35], 93);
        assert_eq!(frame[36], 2);
        let crc = crc16(&frame[..37]);
        assert_eq!(&frame[37..], &crc.to_le_bytes());
    }

    #[test]
    fn test_layout_control_update() {
        let frame = encode(&Message::ControlUpdate(ControlUpdate {
            group: 2,
            automatic: true,
            switches: ActuatorState {
                fan: true,
                water: false,
                light: false,
            },
        }));
        // group, automatic, light, water, fan
        assert_eq!(&frame[..7], &[0xB2, 0x09, 2, 1, 0, 0, 1]);
    }

    #[test]
    fn test_single_bit_corruption() {
        for message in all_messages() {
            let frame = encode(&message);
            // Flipping bits of the type or length byte changes the framing
            // itself, so only payload and CRC bits are checked here.
            for byte in HEADER_SIZE..frame.len() {
                for bit in 0..8 {
                    let mut corrupted = frame.clone();
                    corrupted[byte] ^= 1 << bit;
                    assert!(
                        matches!(decode(&corrupted), Err(DecodeError::CrcMismatch { .. })),
                        "{} byte {} bit {}",
                        message.message_type(),
                        byte,
                        bit
                    );
                }
            }
        }
    }

    #[test]
    fn test_unknown_type() {
        let mut frame = encode(&Message::ReadyToRelay);
        frame[0] = 0x42;
        assert_eq!(decode(&frame), Err(DecodeError::UnknownType(0x42)));
        assert!(matches!(decode(&[]), Err(DecodeError::BufferTooShort { .. })));
    }

    #[test]
    fn test_length_checks() {
        let frame = encode(&Message::OperationResult(ResultCode::ACTUATORS_OK));
        assert!(matches!(
            decode(&frame[..4]),
            Err(DecodeError::BufferTooShort {
                needed: 6,
                available: 4
            })
        ));

        let mut wrong = frame.clone();
        wrong[1] = 7;
        assert!(matches!(decode(&wrong), Err(DecodeError::LengthMismatch { .. })));
    }

    #[test]
    fn test_invalid_mac_rejected() {
        let mut frame = encode(&Message::RawSample(sample()));
        frame[5] = 0x00;
        let crc = crc16(&frame[..37]);
        frame[37..].copy_from_slice(&crc.to_le_bytes());
        assert_eq!(
            decode(&frame),
            Err(DecodeError::InvalidField {
                field: "mac",
                offset: 2
            })
        );
    }

    #[test]
    fn test_assembler_split_chunks() {
        let a = encode(&Message::RawSample(sample()));
        let b = encode(&Message::ReadyToRelay);
        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        let mut assembler = FrameAssembler::new();
        let mut frames = Vec::new();
        for chunk in stream.chunks(5) {
            frames.extend(assembler.push(chunk));
        }

        assert_eq!(frames, vec![a, b]);
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_assembler_resyncs_on_garbage() {
        let frame = encode(&Message::TimestampSync);
        let mut stream = vec![0x00, 0x13, 0x37];
        stream.extend_from_slice(&frame);

        let mut assembler = FrameAssembler::new();
        let frames = assembler.push(&stream);
        assert_eq!(frames, vec![frame]);
        assert_eq!(assembler.dropped_bytes(), 3);
    }

    #[test]
    fn test_assembler_skips_long_garbage_run() {
        let frame = encode(&Message::GroupAggregate(GroupAggregate::unregistered(2)));
        let mut stream = vec![0x00; 200_000];
        stream.extend_from_slice(&frame[..5]);

        let mut assembler = FrameAssembler::new();
        assert!(assembler.push(&stream).is_empty());
        assert_eq!(assembler.dropped_bytes(), 200_000);
        assert_eq!(assembler.pending(), 5);

        assert_eq!(assembler.push(&frame[5..]), vec![frame]);
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_assembler_rejects_bad_length() {
        // Known type byte with an impossible length, followed by a real frame
        let frame = encode(&Message::ReadyToRelay);
        let mut stream = vec![0xA1, 0xFF];
        stream.extend_from_slice(&frame);

        let mut assembler = FrameAssembler::new();
        assert_eq!(assembler.push(&stream), vec![frame]);
    }
}
