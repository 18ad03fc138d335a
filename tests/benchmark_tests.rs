//! Coarse throughput checks for the hot paths: wire encoding, field change
//! detection, frame coalescing, and the per-tick proximity scan. These are
//! smoke tests with generous budgets, meant to catch accidental quadratic
//! blowups rather than to measure precisely.

use std::time::{Duration, Instant};

use glam::Vec3;

use server::{Representation, World};
use shared::field::{DeltaField, FieldValue};
use shared::frame::{next_frame, SendQueue};
use shared::message::RepSnapshot;

const BUDGET: Duration = Duration::from_secs(2);

#[test]
fn bench_snapshot_encode_decode() {
    let snapshot = RepSnapshot {
        network_id: 42,
        parent_id: 7,
        local_prefab: "creature_large".to_owned(),
        remote_prefab: "creature_large_remote".to_owned(),
        fields: vec![
            FieldValue::Float(10.0).encode(),
            FieldValue::Float(0.0).encode(),
            FieldValue::Float(-3.5).encode(),
            FieldValue::Int(1500).encode(),
            FieldValue::Str("a name of usual length".to_owned()).encode(),
            FieldValue::Vec3(Vec3::new(1.0, 2.0, 3.0)).encode(),
        ],
    };

    let started = Instant::now();
    let mut total_bytes = 0usize;
    for _ in 0..50_000 {
        let bytes = snapshot.encode();
        total_bytes += bytes.len();
        let decoded = RepSnapshot::decode(&bytes);
        assert_eq!(decoded.network_id, 42);
    }
    let elapsed = started.elapsed();
    println!(
        "50k snapshot roundtrips ({} bytes total) in {:?}",
        total_bytes, elapsed
    );
    assert!(elapsed < BUDGET, "snapshot codec too slow: {:?}", elapsed);
}

#[test]
fn bench_delta_field_churn() {
    let mut field = DeltaField::new("heading", FieldValue::Float(0.0));
    field.set_resolution(0.01);

    let started = Instant::now();
    let mut sent = 0usize;
    for i in 0..200_000 {
        field.set(FieldValue::Float((i as f32) * 0.005));
        if i % 4 == 0 && field.take_queued().is_some() {
            sent += 1;
        }
    }
    let elapsed = started.elapsed();
    println!("200k field writes ({} diffs drained) in {:?}", sent, elapsed);
    assert!(sent > 0);
    assert!(elapsed < BUDGET, "field churn too slow: {:?}", elapsed);
}

#[test]
fn bench_send_queue_coalescing() {
    let payload = FieldValue::Vec3(Vec3::new(4.0, 5.0, 6.0)).encode();

    let started = Instant::now();
    let mut wire = Vec::new();
    for _ in 0..200 {
        let mut queue = SendQueue::new();
        for _ in 0..500 {
            queue.push(6, &payload);
        }
        wire.clear();
        queue.write_to(&mut wire).unwrap();
    }
    let elapsed = started.elapsed();

    let mut cursor = 0;
    let mut frames = 0usize;
    while next_frame(&wire, &mut cursor).is_some() {
        frames += 1;
    }
    assert_eq!(frames, 500);
    println!("100k frames queued and written in {:?}", elapsed);
    assert!(elapsed < BUDGET, "send queue too slow: {:?}", elapsed);
}

#[test]
fn bench_proximity_scan_over_large_world() {
    let mut world = World::new();
    // 2000 roots spread over a line, each with two children.
    for i in 0..2000 {
        let root = world.allocate_id();
        world.insert(make_rep(root, None, i as f32), true);
        for _ in 0..2 {
            let child = world.allocate_id();
            world.insert(make_rep(child, Some(root), i as f32), true);
        }
    }

    let player_pos = Vec3::new(1000.0, 0.0, 0.0);
    let render_range = 50.0;

    let started = Instant::now();
    let mut in_range = 0usize;
    for _ in 0..500 {
        in_range = 0;
        for root in world.active_root_ids() {
            let rep = world.get(root).unwrap();
            if player_pos.distance(rep.position()) < rep.radius + render_range {
                in_range += world.subtree_top_down(root).len();
            }
        }
    }
    let elapsed = started.elapsed();

    // Strictly inside 55 units of x=1000: roots at 946..=1054, three
    // nodes each.
    assert_eq!(in_range, 109 * 3);
    println!("500 proximity scans over 6000 nodes in {:?}", elapsed);
    assert!(elapsed < BUDGET, "proximity scan too slow: {:?}", elapsed);
}

#[test]
fn bench_subtree_removal_and_reinsert() {
    let started = Instant::now();
    for _ in 0..200 {
        let mut world = World::new();
        let root = world.allocate_id();
        world.insert(make_rep(root, None, 0.0), true);
        let mut parent = root;
        for depth in 1..100 {
            let id = world.allocate_id();
            world.insert(make_rep(id, Some(parent), depth as f32), true);
            parent = id;
        }
        assert_eq!(world.remove_subtree(root).len(), 100);
        assert_eq!(world.rep_count(), 0);
    }
    let elapsed = started.elapsed();
    println!("200 builds and removals of a 100-deep chain in {:?}", elapsed);
    assert!(elapsed < BUDGET, "subtree removal too slow: {:?}", elapsed);
}

// HELPER FUNCTIONS

fn make_rep(id: i32, parent: Option<i32>, x: f32) -> Representation {
    let fields = vec![
        FieldValue::Float(x).encode(),
        FieldValue::Float(0.0).encode(),
        FieldValue::Float(0.0).encode(),
    ];
    Representation::new(id, parent, "rock".into(), "rock".into(), fields)
}
