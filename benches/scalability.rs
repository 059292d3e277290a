//! Scalability benchmarks for the arena instance server
//!
//! Measures per-tick barn updates and net-sync encoding as the live entity
//! count grows.
//!
//! Run with: cargo bench --bench scalability

use arena_instance_server::config::GameConfig;
use arena_instance_server::game::constants::tick::TICK_RATE;
use arena_instance_server::game::decal::{DecalBarn, DecalDefs};
use arena_instance_server::game::instance::GameInstance;
use arena_instance_server::game::registry::EntityRegistry;
use arena_instance_server::game::smoke::SmokeBarn;
use arena_instance_server::net::protocol::{ClientMsg, JoinMsg};
use arena_instance_server::net::stream::encode;
use arena_instance_server::game::constants::net::PROTOCOL_VERSION;
use arena_instance_server::util::vec2::Vec2;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const DT: f32 = 1.0 / TICK_RATE as f32;
const COUNTS: [usize; 4] = [100, 500, 1000, 2000];

fn random_pos(rng: &mut StdRng) -> Vec2 {
    Vec2::new(rng.gen_range(0.0..1024.0), rng.gen_range(0.0..1024.0))
}

fn join_frame(name: &str) -> Vec<u8> {
    encode(&ClientMsg::Join(JoinMsg {
        protocol: PROTOCOL_VERSION,
        name: name.into(),
        ..Default::default()
    }))
    .unwrap_or_default()
}

/// A running instance with one established connection and `count` smokes
fn instance_with_smokes(count: usize) -> GameInstance {
    let mut game = GameInstance::new(
        "bench",
        GameConfig {
            seed: Some(7),
            ..GameConfig::default()
        },
    );
    game.init();
    game.handle_socket_msg("s0", "127.0.0.1", &join_frame("bench"));
    game.net_sync();

    let mut rng = StdRng::seed_from_u64(count as u64);
    for _ in 0..count {
        let _ = game.spawn_smoke(random_pos(&mut rng), 0, false);
    }
    game.net_sync();
    game
}

/// Benchmark decal aging at various entity counts
fn bench_decal_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("decal_update");
    group.sample_size(50);

    for count in COUNTS {
        let mut rng = StdRng::seed_from_u64(1);
        let mut registry = EntityRegistry::new();
        let mut barn = DecalBarn::new(DecalDefs::builtin());
        for _ in 0..count {
            let pos = random_pos(&mut rng);
            let _ = barn.add_decal("decal_bathroom_tile", pos, 0, None, None, &mut registry, &mut rng);
        }

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("permanent", count), &count, |b, _| {
            b.iter(|| black_box(barn.update(DT, &mut registry)))
        });
    }
    group.finish();
}

/// Benchmark smoke growth, which dirties every entity each tick
fn bench_smoke_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("smoke_update");
    group.sample_size(50);

    for count in COUNTS {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("grow", count), &count, |b, &count| {
            b.iter_batched(
                || {
                    let mut rng = StdRng::seed_from_u64(2);
                    let mut registry = EntityRegistry::new();
                    let mut barn = SmokeBarn::new();
                    for _ in 0..count {
                        let _ = barn.add_smoke(random_pos(&mut rng), 0, false, &mut registry);
                    }
                    (barn, registry)
                },
                |(mut barn, mut registry)| black_box(barn.update(DT, &mut registry)),
                BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

/// Benchmark one tick plus the shared delta for an established connection
fn bench_net_sync_delta(c: &mut Criterion) {
    let mut group = c.benchmark_group("net_sync_delta");
    group.sample_size(30);

    for count in COUNTS {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("smokes", count), &count, |b, &count| {
            b.iter_batched(
                || instance_with_smokes(count),
                |mut game| {
                    game.update(DT);
                    black_box(game.net_sync())
                },
                BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

/// Benchmark the full snapshot a late joiner receives
fn bench_net_sync_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("net_sync_snapshot");
    group.sample_size(30);

    for count in COUNTS {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("late_join", count), &count, |b, &count| {
            b.iter_batched(
                || {
                    let mut game = instance_with_smokes(count);
                    game.handle_socket_msg("s1", "127.0.0.1", &join_frame("late"));
                    game
                },
                |mut game| black_box(game.net_sync()),
                BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_decal_update,
    bench_smoke_update,
    bench_net_sync_delta,
    bench_net_sync_snapshot,
);

criterion_main!(benches);
