//! Codec benchmarks for huddle-protocol.

#![allow(clippy::unwrap_used)]

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use huddle_protocol::{codec, RoomPresenceRecord, ServerEvent, ServerFrame, Topic, UserRecord};

fn presence_frame(members: usize) -> ServerFrame {
    let users = (0..members)
        .map(|i| UserRecord {
            user_id: format!("user-{i}"),
            username: format!("User {i}"),
            current_room: Some("lobby".into()),
            last_seen: 1_700_000_000_000,
            online: true,
            created_at: 1_700_000_000_000,
        })
        .collect();

    ServerFrame::event(
        Topic::Room("lobby".into()),
        ServerEvent::RoomPresence(RoomPresenceRecord {
            room_id: "lobby".into(),
            user_count: members,
            users,
        }),
    )
}

fn bench_encode(c: &mut Criterion) {
    let frame = presence_frame(50);

    let mut group = c.benchmark_group("encode_presence_50");
    group.throughput(Throughput::Elements(1));
    group.bench_function("msgpack", |b| b.iter(|| codec::encode(black_box(&frame))));
    group.bench_function("json", |b| {
        b.iter(|| codec::encode_json(black_box(&frame)))
    });
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let frame = presence_frame(50);
    let binary = codec::encode(&frame).unwrap();
    let text = codec::encode_json(&frame).unwrap();

    let mut group = c.benchmark_group("decode_presence_50");
    group.throughput(Throughput::Elements(1));
    group.bench_function("msgpack", |b| {
        b.iter(|| codec::decode::<ServerFrame>(black_box(&binary)))
    });
    group.bench_function("json", |b| {
        b.iter(|| codec::decode_json::<ServerFrame>(black_box(&text)))
    });
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
