use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use concourse_core::{LayoutId, SimulationConfig, WorldState};
use std::time::Duration;

const DT: f32 = 1.0 / 60.0;

fn bench_world_ticks(c: &mut Criterion) {
    let mut group = c.benchmark_group("world_tick");
    group.sample_size(30);
    group.warm_up_time(Duration::from_secs(2));
    group.measurement_time(Duration::from_secs(8));

    let steps: usize = std::env::var("CONCOURSE_BENCH_STEPS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64);
    let populations: Vec<usize> = std::env::var("CONCOURSE_BENCH_AGENTS")
        .ok()
        .map(|s| {
            s.split(',')
                .filter_map(|t| t.trim().parse::<usize>().ok())
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec![50, 200, 500]);

    for &population in &populations {
        group.bench_function(format!("steps{steps}_agents{population}"), |b| {
            b.iter_batched(
                || {
                    let config = SimulationConfig {
                        rng_seed: Some(0xBEEF),
                        population_target: population,
                        visit_chance: 0.5,
                        summary_interval: 0,
                        ..SimulationConfig::default()
                    };
                    let mut world =
                        WorldState::with_layout(config, LayoutId::Gallery).expect("world");
                    // populate before measuring
                    world.tick(DT);
                    world
                },
                |mut world| {
                    for _ in 0..steps {
                        world.tick(DT);
                    }
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_world_ticks);
criterion_main!(benches);
