//! Criterion benchmarks for the scan cycle.
//!
//! - `idle_line`: RUN=0, one bottle at the inlet
//! - `filling`: a bottle parked under the open nozzle with droplets piling up
//! - `register_reads`: multi-register reads in both consistency modes

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

use bottling_plc::registers::{Consistency, RegisterMap, Tag};
use bottling_plc::{Plant, PlantConfig};

fn build_plant(consistency: Consistency, running: bool) -> Plant {
    let mut config = PlantConfig::default();
    config.simulation.realtime = false;
    config.simulation.start_running = running;
    config.registers.consistency = consistency;
    Plant::from_config(&config).expect("default config is valid")
}

/// Run until the first bottle is under the nozzle and filling has begun
fn build_filling_plant() -> Plant {
    let mut plant = build_plant(Consistency::PerAddress, true);
    for _ in 0..2000 {
        plant.tick().expect("tick failed");
        if plant.droplet_count() >= 30 {
            break;
        }
    }
    plant
}

fn bench_idle_line(c: &mut Criterion) {
    let mut plant = build_plant(Consistency::PerAddress, false);
    c.bench_function("idle_line_tick", |b| {
        b.iter(|| black_box(plant.tick().expect("tick failed")))
    });
}

fn bench_filling(c: &mut Criterion) {
    let mut group = c.benchmark_group("filling");
    group.sample_size(20);
    group.bench_function("tick", |b| {
        b.iter_batched(
            build_filling_plant,
            |mut plant| {
                for _ in 0..10 {
                    black_box(plant.tick().expect("tick failed"));
                }
            },
            criterion::BatchSize::LargeInput,
        )
    });
    group.finish();
}

fn bench_register_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("register_reads");
    for (name, consistency) in [
        ("per_address", Consistency::PerAddress),
        ("tick_snapshot", Consistency::TickSnapshot),
    ] {
        let registers = RegisterMap::new(100, consistency).unwrap();
        registers.set_tag(Tag::Run, 1);
        group.bench_function(name, |b| {
            b.iter(|| black_box(registers.get(0, 100).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_idle_line, bench_filling, bench_register_reads);
criterion_main!(benches);
