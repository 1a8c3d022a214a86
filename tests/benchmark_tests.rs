//! Performance benchmarks for the hot paths of the reactor tick

use server::action_queue::{ActionQueue, FrameCursor};
use shared::stat_string::{self, MapStats};
use shared::w3gs::{self, GameInfo, IncomingAction};
use shared::{scan_frames, FrameVerdict, Product};
use std::time::Instant;

/// Benchmarks the framing loop over a receive buffer full of small packets
#[test]
fn benchmark_frame_scanning() {
    let mut buf = Vec::new();
    for i in 0..10_000u32 {
        buf.extend(w3gs::send_ping_from_host(i));
    }

    let iterations = 100;
    let start = Instant::now();
    let mut packets = 0;

    for _ in 0..iterations {
        let scan = scan_frames::<(), _>(&buf, |packet| {
            if w3gs::receive_pong_to_host(packet).is_none() {
                packets += 1;
            }
            FrameVerdict::Continue
        });
        assert_eq!(scan.consumed, buf.len());
    }

    let duration = start.elapsed();
    println!(
        "Frame scanning: {} packets in {:?} ({:.2} ns/packet)",
        packets,
        duration,
        duration.as_nanos() as f64 / packets as f64
    );

    assert_eq!(packets, 1_000_000);
    assert!(duration.as_secs() < 5);
}

/// Benchmarks the scheduler's per-frame work: close, serialize, retire
#[test]
fn benchmark_action_frames() {
    let mut queue = ActionQueue::new();
    let mut cursor = FrameCursor::at(0);
    let frames = 10_000;
    let mut bytes_out = 0;
    let start = Instant::now();

    for i in 0..frames {
        for uid in 1..=4u8 {
            queue.tail_mut().add_action(IncomingAction {
                uid,
                data: vec![0x12, (i % 256) as u8, uid, 0, 0, 0],
            });
        }
        let current = queue.close_tail();
        cursor.follow(current);
        if let Some(bytes) = queue.deliver(&mut cursor, 100) {
            bytes_out += bytes.len();
        }
        queue.retire_through(cursor.retire_bound());
    }

    let duration = start.elapsed();
    println!(
        "Action frames: {} frames, {} bytes in {:?} ({:.2} μs/frame)",
        frames,
        bytes_out,
        duration,
        duration.as_micros() as f64 / frames as f64
    );

    assert!(queue.len() <= 2);
    assert!(duration.as_secs() < 5);
}

/// Benchmarks a GAMEINFO round trip, stat string included
#[test]
fn benchmark_gameinfo_codec() {
    let info = GameInfo {
        product: Product::from_tft(true),
        version: 26,
        host_counter: 7,
        entry_key: 0x1234_5678,
        game_name: "dota 6.83d allpick".to_string(),
        stats: MapStats {
            map_flags: 0x0000_6002,
            map_width: 116,
            map_height: 116,
            map_crc: 0xCAFE_BABE,
            map_path: "Maps\\Download\\DotA v6.83d.w3x".to_string(),
            host_name: "Aura".to_string(),
        },
        slots_total: 12,
        game_type: 1,
        slots_open: 9,
        elapsed_secs: 42,
        port: 6113,
    };

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let packet = w3gs::send_gameinfo(&info);
        let decoded = w3gs::receive_gameinfo(&packet);
        assert_eq!(decoded.map(|d| d.host_counter), Some(7));
    }

    let duration = start.elapsed();
    println!(
        "GAMEINFO codec: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_secs() < 5);
}

/// Stress test: stat string encoding of a long buffer with many zero bytes
#[test]
fn stress_test_stat_string() {
    let raw: Vec<u8> = (0..4096u32).map(|i| if i % 3 == 0 { 0 } else { i as u8 }).collect();

    let iterations = 1_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let encoded = stat_string::encode(&raw);
        assert!(!encoded.contains(&0));
        assert_eq!(stat_string::decode(&encoded), raw);
    }

    let duration = start.elapsed();
    println!(
        "Stat string: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_secs() < 5);
}
