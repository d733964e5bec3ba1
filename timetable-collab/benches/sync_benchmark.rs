use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use timetable_collab::{
    AwarenessEntry, AwarenessStore, AwarenessUpdate, ConnectionManager, PresenceEvent,
    PresenceRecord, PresenceUser, ScheduleDoc, SessionRegistry, SyncMessage,
};

fn bench_update_encode(c: &mut Criterion) {
    let update = ScheduleDoc::with_client_id(1).set_cell("R1C1", "CS101");

    c.bench_function("update_envelope_encode", |b| {
        b.iter(|| {
            let msg = SyncMessage::Update(black_box(update.clone()));
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let update = ScheduleDoc::with_client_id(1).set_cell("R1C1", "CS101");
    let encoded = SyncMessage::Update(update).encode().unwrap();

    c.bench_function("update_envelope_decode", |b| {
        b.iter(|| {
            black_box(SyncMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_apply_update(c: &mut Criterion) {
    let source = ScheduleDoc::with_client_id(1);
    let updates: Vec<Vec<u8>> = (0..100)
        .map(|i| source.set_cell(&format!("R{}C{}", i / 10, i % 10), "CS101"))
        .collect();

    c.bench_function("apply_100_cell_updates", |b| {
        b.iter(|| {
            let replica = ScheduleDoc::with_client_id(2);
            for update in &updates {
                black_box(replica.apply_update(update).unwrap());
            }
        })
    });

    let full = source.encode_state();
    c.bench_function("apply_duplicate_full_state", |b| {
        let replica = ScheduleDoc::with_client_id(2);
        replica.apply_update(&full).unwrap();
        b.iter(|| {
            black_box(replica.apply_update(black_box(&full)).unwrap());
        })
    });
}

fn bench_awareness_merge(c: &mut Criterion) {
    let update = AwarenessUpdate {
        entries: (0..50)
            .map(|i| AwarenessEntry {
                client_id: i,
                clock: 1,
                state: Some(PresenceRecord::new(format!("u{i}"), format!("User {i}")).with_active_cell("R1C1")),
            })
            .collect(),
    };
    let encoded = update.encode().unwrap();

    c.bench_function("awareness_merge_50_users", |b| {
        b.iter(|| {
            let mut store = AwarenessStore::new();
            let decoded = AwarenessUpdate::decode(black_box(&encoded)).unwrap();
            black_box(store.apply_update(&decoded));
        })
    });
}

fn bench_presence_list_encode(c: &mut Criterion) {
    let users: Vec<PresenceUser> = (0..50)
        .map(|i| {
            PresenceUser::from_record(
                i,
                PresenceRecord::new(format!("u{i}"), format!("User {i}")).with_active_cell("R3C2"),
            )
        })
        .collect();
    let event = PresenceEvent::Awareness { users };

    c.bench_function("presence_list_encode_50_users", |b| {
        b.iter(|| {
            black_box(event.encode().unwrap());
        })
    });
}

fn bench_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let manager = ConnectionManager::new(Arc::new(SessionRegistry::new(
        Duration::from_secs(60),
        1024,
    )));
    let mut peers = rt.block_on(async {
        let mut peers = Vec::new();
        for _ in 0..100 {
            peers.push(manager.admit("schedule-bench").await.handle);
        }
        peers
    });
    let source = ScheduleDoc::with_client_id(1);
    let mut row = 0u64;

    c.bench_function("update_fan_out_100_peers", |b| {
        b.iter(|| {
            row += 1;
            let update = source.set_cell(&format!("R{row}C1"), "CS101");
            rt.block_on(async {
                let origin = &peers[0];
                manager
                    .engine()
                    .apply_update(origin.session(), origin.id(), update)
                    .await
                    .unwrap();
                for peer in peers.iter_mut().skip(1) {
                    black_box(peer.events().recv().await.unwrap());
                }
            });
        })
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_apply_update,
    bench_awareness_merge,
    bench_presence_list_encode,
    bench_fan_out,
);
criterion_main!(benches);
