//! Stream-level tests for the AgriNet internal link
//!
//! Stress cases run with: cargo test --release stress -- --ignored

use agrinet::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Instant;

fn sweep(peers: u8) -> Vec<Message> {
    let mut messages = vec![Message::TimestampSync];
    for i in 0..peers {
        messages.push(Message::RawSample(RawSample {
            mac: MacAddress::from_octets([0xd4, 0x3a, 0x2c, 0x00, 0x00, i]),
            temperature: 2200 + i as i32 * 10,
            humidity: 6000,
            soil_moisture: 5100 - i as i32,
            light: 140,
            battery: 95,
            group: i % MAX_GROUPS as u8 + 1,
        }));
    }
    for group in 1..=MAX_GROUPS as u8 {
        messages.push(Message::GroupAggregate(GroupAggregate {
            group,
            temperature: 2300,
            humidity: 6000,
            soil_moisture: 5000,
            light: 140,
            actuators: ActuatorState::OFF,
            registered: true,
        }));
    }
    messages.push(Message::ReadyToRelay);
    messages
}

// ============================================================================
// Reassembly
// ============================================================================

#[test]
fn test_random_chunking_preserves_frames() {
    let messages = sweep(20);
    let stream: Vec<u8> = messages.iter().flat_map(encode).collect();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..50 {
        let mut assembler = FrameAssembler::new();
        let mut decoded = Vec::new();
        let mut rest = stream.as_slice();
        while !rest.is_empty() {
            let take = rng.gen_range(1..=rest.len().min(40));
            let (chunk, tail) = rest.split_at(take);
            for frame in assembler.push(chunk) {
                decoded.push(decode(&frame).unwrap());
            }
            rest = tail;
        }
        assert_eq!(decoded, messages);
        assert_eq!(assembler.pending(), 0);
        assert_eq!(assembler.dropped_bytes(), 0);
    }
}

// ============================================================================
// Corruption
// ============================================================================

#[test]
fn test_random_payload_corruption_detected() {
    let mut rng = StdRng::seed_from_u64(42);
    for message in sweep(10) {
        let frame = encode(&message);
        if frame.len() <= 2 + 2 {
            continue;
        }
        for _ in 0..100 {
            let byte = rng.gen_range(2..frame.len());
            let bit = rng.gen_range(0..8);
            let mut corrupted = frame.clone();
            corrupted[byte] ^= 1 << bit;
            assert!(
                matches!(decode(&corrupted), Err(DecodeError::CrcMismatch { .. })),
                "{} byte {} bit {} went undetected",
                message.message_type(),
                byte,
                bit
            );
        }
    }
}

#[test]
fn test_crc_error_code_matches_frame_type() {
    let mut frame = encode(&Message::GroupAggregate(GroupAggregate::unregistered(2)));
    frame[3] ^= 0x01;
    let msg_type = peek_type(&frame).unwrap();
    assert_eq!(msg_type, MessageType::GroupAggregate);
    assert_eq!(
        ResultCode::crc_error_for(msg_type),
        ResultCode::GROUP_MEAN_CRC_ERROR
    );
}

// ============================================================================
// Stress
// ============================================================================

#[test]
#[ignore] // Run manually with --ignored
fn stress_test_codec_roundtrip() {
    let messages = sweep(20);
    let iterations = 100_000;
    let start = Instant::now();

    for i in 0..iterations {
        let message = &messages[i % messages.len()];
        let decoded = decode(&encode(message)).unwrap();
        assert_eq!(&decoded, message, "Roundtrip failed at iteration {}", i);
    }

    let elapsed = start.elapsed();
    let rate = iterations as f64 / elapsed.as_secs_f64();
    println!("Round-tripped {} frames in {:?}", iterations, elapsed);
    println!("Rate: {:.0} frames/second", rate);

    assert!(
        rate > 100_000.0,
        "Should round-trip at least 100k frames/s, got {:.0}",
        rate
    );
}
