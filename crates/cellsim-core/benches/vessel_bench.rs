use cellsim_core::{Simulation, SimulationConfig, VesselId};
use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

fn plate(vessels: usize) -> Simulation {
    let config = SimulationConfig {
        master_seed: Some(0xBEEF),
        history_capacity: 1,
        ..SimulationConfig::default()
    };
    let mut sim = Simulation::new(config).expect("simulation");
    for idx in 0..vessels {
        let id = VesselId::new(format!("P1_{idx:03}"));
        sim.seed(id.clone(), "A549", 5.0e5, idx % 12 == 0)
            .expect("seed");
        if idx % 2 == 0 {
            sim.treat(&id, "staurosporine", 0.5).expect("treat");
        }
    }
    sim
}

fn bench_vessel_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("vessel_step");
    group.sample_size(env_or("CELLSIM_BENCH_SAMPLES", 20_usize).max(10));
    group.warm_up_time(Duration::from_secs(env_or("CELLSIM_BENCH_WARMUP_SECS", 2)));
    group.measurement_time(Duration::from_secs(env_or("CELLSIM_BENCH_MEASURE_SECS", 8)));
    let hours: f64 = env_or("CELLSIM_BENCH_HOURS", 24.0);

    group.bench_function(format!("single_vessel_{hours}h"), |b| {
        b.iter_batched(
            || plate(1),
            |mut sim| {
                sim.advance_time(&VesselId::new("P1_000"), hours)
                    .expect("advance");
                sim
            },
            BatchSize::SmallInput,
        );
    });

    for vessels in [24_usize, 96] {
        group.bench_function(format!("plate{vessels}_{hours}h_parallel"), |b| {
            b.iter_batched(
                || plate(vessels),
                |mut sim| {
                    sim.advance_all(hours).expect("advance");
                    sim
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_vessel_steps);
criterion_main!(benches);
