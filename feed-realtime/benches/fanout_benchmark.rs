use criterion::{criterion_group, criterion_main, Criterion};
use feed_realtime::broadcast::{ConnectionHub, Frame, RoomManager, SocketId};
use feed_realtime::protocol::{ClientEvent, RoomDescriptor, ServerEvent};
use feed_realtime::room;
use feed_realtime::storage::{RocksMessageStore, StoreConfig};
use feed_realtime::{Identity, NewChatMessage};
use std::hint::black_box;
use tokio::runtime::Runtime;

fn bench_resolve_single(c: &mut Criterion) {
    let descriptor = RoomDescriptor::single("7f1c2d9e-user-b");

    c.bench_function("resolve_single_room", |b| {
        b.iter(|| black_box(room::resolve(black_box(&descriptor), black_box("0a9b-user-a"))))
    });
}

fn bench_client_event_decode(c: &mut Criterion) {
    let frame = ClientEvent::Message {
        room: RoomDescriptor::group("general"),
        content: "x".repeat(140),
    }
    .encode()
    .unwrap();

    c.bench_function("client_event_decode_140B", |b| {
        b.iter(|| black_box(ClientEvent::decode(black_box(&frame)).unwrap()))
    });
}

fn bench_server_event_encode(c: &mut Criterion) {
    let event = ServerEvent::error("Invalid message data");

    c.bench_function("server_event_encode", |b| {
        b.iter(|| black_box(black_box(&event).encode().unwrap()))
    });
}

fn bench_fan_out(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("fan_out");

    for members in [2usize, 10, 100] {
        let hub = ConnectionHub::new(1024);
        let rooms = RoomManager::new();
        let mut receivers = Vec::with_capacity(members);
        rt.block_on(async {
            for _ in 0..members {
                let socket = SocketId::new();
                receivers.push(hub.register(socket).await);
                rooms.join("general", socket).await;
            }
        });
        let frame: Frame = Frame::from(r#"{"event":"chat:message","data":{}}"#);

        group.bench_function(format!("{members}_members"), |b| {
            b.iter(|| {
                rt.block_on(async {
                    let delivered = rooms.fan_out(&hub, "general", &frame).await;
                    for rx in receivers.iter_mut() {
                        while rx.try_recv().is_ok() {}
                    }
                    black_box(delivered)
                })
            })
        });
    }
    group.finish();
}

fn bench_rocks_append(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksMessageStore::open(StoreConfig::for_testing(dir.path().join("bench"))).unwrap();
    let sender = Identity::new("u1", "alice");

    c.bench_function("rocks_append_message", |b| {
        b.iter(|| {
            let message = NewChatMessage {
                id: uuid::Uuid::new_v4().to_string(),
                content: "hello there".to_string(),
                sender: sender.clone(),
                room_key: "u1:u2".to_string(),
                created_at: chrono::Utc::now(),
            };
            black_box(store.append_message(message).unwrap())
        })
    });
}

fn bench_rocks_history(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksMessageStore::open(StoreConfig::for_testing(dir.path().join("bench"))).unwrap();
    let sender = Identity::new("u1", "alice");
    for i in 0..1_000 {
        store
            .append_message(NewChatMessage {
                id: i.to_string(),
                content: format!("message {i}"),
                sender: sender.clone(),
                room_key: "general".to_string(),
                created_at: chrono::Utc::now(),
            })
            .unwrap();
    }

    c.bench_function("rocks_history_page_50", |b| {
        b.iter(|| black_box(store.load_history(black_box("general"), 50).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_resolve_single,
    bench_client_event_decode,
    bench_server_event_encode,
    bench_fan_out,
    bench_rocks_append,
    bench_rocks_history,
);

criterion_main!(benches);
