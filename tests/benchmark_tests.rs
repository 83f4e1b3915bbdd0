//! Performance benchmarks for the prediction hot paths

use glam::Vec3;
use shared::actor::{actor_body, ActorKind};
use shared::config::SimulationConfig;
use shared::input::{compress_inputs, decompress_inputs, Buttons, InputBuffer, InputSample};
use shared::physics::SimpleWorld;
use shared::protocol::Packet;
use shared::ring_buffer::RingBuffer;
use shared::simulation::SimulationDriver;
use std::time::Instant;

/// Benchmarks ring buffer pushes with eviction
#[test]
fn benchmark_ring_buffer_push() {
    let mut ring = RingBuffer::new(128);
    let iterations = 1_000_000;
    let start = Instant::now();

    for value in 0..iterations {
        ring.push(value);
    }

    let duration = start.elapsed();
    println!(
        "Ring push: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert_eq!(ring.newest().copied().ok(), Some(iterations - 1));
    assert!(duration.as_millis() < 500);
}

/// Benchmarks a 60-frame rollback over a crowded world
#[test]
fn benchmark_replay_sixty_frames() {
    let mut driver = SimulationDriver::new(SimpleWorld::arena(), SimulationConfig::default());
    for object_id in 1..=64 {
        let kind = if object_id == 1 { ActorKind::roller() } else { ActorKind::Passive };
        driver
            .register_object(object_id, actor_body(object_id), kind)
            .unwrap();
    }
    driver.control_object(1).unwrap();
    driver.record_current().unwrap();

    for frame in 1..=60 {
        driver
            .step_with(vec![InputSample::new(frame, 1, Vec3::X, Buttons::NONE)])
            .unwrap();
    }
    let rewind_to = driver.history().find(0).unwrap().clone();

    let iterations = 20;
    let start = Instant::now();
    for _ in 0..iterations {
        let replayed = driver.resimulate_from(&rewind_to).unwrap();
        assert_eq!(replayed, 60);
    }

    let duration = start.elapsed();
    println!(
        "Replay: {} x 60 frames with 64 bodies in {:?} ({:.2} ms/replay)",
        iterations,
        duration,
        duration.as_secs_f64() * 1000.0 / iterations as f64
    );

    assert!(duration.as_secs() < 5);
}

/// Benchmarks compressing and encoding a redundant input window
#[test]
fn benchmark_input_compression() {
    let mut buffer = InputBuffer::new(128);
    for frame in 1..=128 {
        let movement = if (frame / 8) % 2 == 0 { Vec3::X } else { Vec3::Z };
        buffer.push(InputSample::new(frame, 1, movement, Buttons::NONE));
    }

    let iterations = 10_000;
    let start = Instant::now();
    let mut bytes = 0;

    for _ in 0..iterations {
        let inputs = compress_inputs(&buffer.redundant(32));
        let packet = Packet::Inputs { inputs };
        bytes = packet.encode().unwrap().len();
    }

    let duration = start.elapsed();
    println!(
        "Input compression: {} iterations in {:?} ({:.2} us/iter, {} bytes)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64,
        bytes
    );

    let compressed = compress_inputs(&buffer.redundant(32));
    assert!(compressed.len() <= 5);
    assert_eq!(decompress_inputs(&compressed).len(), 32);
    assert!(duration.as_secs() < 2);
}
