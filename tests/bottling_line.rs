//! Whole-line scenarios driven through the public API

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use bottling_plc::dispatch::Reaction;
use bottling_plc::entity::layout;
use bottling_plc::plant::{ControlState, TickReport};
use bottling_plc::registers::{Consistency, Tag};
use bottling_plc::{Plant, PlantConfig};

const TICK_BUDGET: u64 = 5000;

fn config(consistency: Consistency) -> PlantConfig {
    let mut config = PlantConfig::default();
    config.server.enabled = false;
    config.simulation.realtime = false;
    config.registers.consistency = consistency;
    config
}

fn tick_until(
    plant: &mut Plant,
    mut done: impl FnMut(&Plant, &TickReport) -> bool,
) -> TickReport {
    for _ in 0..TICK_BUDGET {
        let report = plant.tick().expect("tick failed");
        if done(plant, &report) {
            return report;
        }
    }
    panic!("condition not reached within {TICK_BUDGET} ticks");
}

#[test]
fn test_fill_cycle_end_to_end() {
    let mut plant = Plant::from_config(&config(Consistency::PerAddress)).unwrap();
    let registers = Arc::clone(plant.registers());
    let first = plant.bottles()[0].id;

    assert_eq!(registers.tag(Tag::Run), 0);
    assert_eq!(plant.bottles().len(), 1);

    registers.set_tag(Tag::Run, 1);

    // The next bottle appears only once the first one has cleared the inlet
    let report = tick_until(&mut plant, |plant, report| {
        if report.spawned_bottles.is_empty() {
            assert_eq!(plant.bottles().len(), 1, "tick {}", report.tick);
        }
        !report.spawned_bottles.is_empty()
    });
    assert!(report.reactions.contains(&Reaction::SpawnBottle));
    assert_eq!(report.spawned_bottles.len(), 1);
    let position = plant.bottle_position(first).unwrap();
    assert!(position.x + layout::BOTTLE_LEFT > layout::BOTTLE_INLET_SENSOR.x);
    assert_eq!(plant.bottles().len(), 2);

    // Bottle reaches the fill position
    tick_until(&mut plant, |_, report| {
        report.reactions.contains(&Reaction::BottleInPlace)
    });
    assert_eq!(registers.tag(Tag::LimitSwitch), 1);
    assert_eq!(registers.tag(Tag::LevelSensor), 0);
    assert_eq!(registers.tag(Tag::Nozzle), 1);

    // The conveyor stops while filling
    let report = plant.tick().unwrap();
    assert_eq!(report.written(Tag::Motor), Some(0));
    let parked = plant.bottle_position(first).unwrap();

    let report = tick_until(&mut plant, |_, report| {
        report.reactions.contains(&Reaction::LevelReached)
    });
    assert_eq!(registers.tag(Tag::LevelSensor), 1);
    assert_eq!(registers.tag(Tag::Nozzle), 0);
    assert_eq!(registers.tag(Tag::LimitSwitch), 0);
    assert_eq!(plant.bottle_position(first).unwrap(), parked);
    assert!(report.tick > 0);
    assert_eq!(plant.stats().bottles_filled, 1);

    // And restarts once full
    let report = plant.tick().unwrap();
    assert_eq!(report.written(Tag::Motor), Some(1));
    assert!(plant.bottle_position(first).unwrap().x > parked.x);
}

#[test]
fn test_bottle_travels_and_is_evicted_once() {
    let mut plant = Plant::from_config(&config(Consistency::PerAddress)).unwrap();
    let registers = Arc::clone(plant.registers());
    let first = plant.bottles()[0].id;
    let step = PlantConfig::default().simulation.conveyor_step;
    let bound = PlantConfig::default().workspace.right_bound();

    registers.set_tag(Tag::Run, 1);

    let mut evicted_at = None;
    for t in 1..=TICK_BUDGET {
        // Act as the master: keep the line moving and the nozzle shut
        registers.set_tag(Tag::LimitSwitch, 0);
        registers.set_tag(Tag::Nozzle, 0);

        let report = plant.tick().unwrap();
        assert_eq!(report.written(Tag::Motor), Some(1));
        assert!(report.spawned_droplet.is_none());

        let hits = report.eviction.bottles.iter().filter(|&&id| id == first).count();
        match (hits, evicted_at) {
            (0, None) => {
                let x = plant.bottle_position(first).unwrap().x;
                let expected = layout::BOTTLE_INLET.x + t as f32 * step;
                assert!((x - expected).abs() < 1e-2, "tick {t}: {x} != {expected}");
                assert!(x <= bound, "tick {t}: retained past the bound at {x}");
            }
            (1, None) => evicted_at = Some(t),
            (0, Some(_)) => assert!(plant.bottle_position(first).is_none()),
            _ => panic!("bottle evicted twice"),
        }
    }

    let evicted_at = evicted_at.expect("bottle never evicted");
    let expected = ((bound - layout::BOTTLE_INLET.x) / step) as u64 + 1;
    assert!(evicted_at.abs_diff(expected) <= 1, "evicted at {evicted_at}, expected {expected}");
    assert!(plant.stats().bottles_shipped >= 1);
}

#[test]
fn test_run_zero_writes_no_process_register() {
    for consistency in [Consistency::PerAddress, Consistency::TickSnapshot] {
        let mut plant = Plant::from_config(&config(consistency)).unwrap();
        let registers = Arc::clone(plant.registers());

        // Values forced by a master survive any number of stopped ticks
        registers.set_tag(Tag::Motor, 1);
        registers.set_tag(Tag::Nozzle, 1);

        for _ in 0..300 {
            let report = plant.tick().unwrap();
            assert_eq!(report.state, ControlState::Stopped);
            assert!(report.register_writes.is_empty());
            assert!(report.spawned_droplet.is_none());
        }
        assert_eq!(registers.tag(Tag::Motor), 1);
        assert_eq!(registers.tag(Tag::Nozzle), 1);
        assert_eq!(registers.tag(Tag::LimitSwitch), 0);
        assert_eq!(registers.tag(Tag::LevelSensor), 0);
        assert_eq!(plant.bottles().len(), 1);
    }
}

#[test]
fn test_master_writes_during_stop_survive_restart() {
    let seeded = || {
        let mut config = config(Consistency::PerAddress);
        config.simulation.start_running = true;
        Plant::from_config(&config).unwrap()
    };

    // Tick at which the first bottle reports full
    let mut reference = seeded();
    let full_at = tick_until(&mut reference, |_, report| {
        report.reactions.contains(&Reaction::LevelReached)
    })
    .tick;

    let mut plant = seeded();
    let registers = Arc::clone(plant.registers());
    for _ in 1..full_at {
        plant.tick().unwrap();
    }
    assert_eq!(registers.tag(Tag::Nozzle), 1);

    // Stop just before the level is reached and let the droplets settle
    registers.set_tag(Tag::Run, 0);
    tick_until(&mut plant, |plant, _| !plant.deferred_writes().is_empty());
    for _ in 0..250 {
        let report = plant.tick().unwrap();
        assert!(report.register_writes.is_empty());
    }
    assert!(plant.deferred_writes().contains(&(Tag::LevelSensor, 1)));

    registers.set_tag(Tag::Nozzle, 1);
    registers.set_tag(Tag::LimitSwitch, 1);
    registers.set_tag(Tag::LevelSensor, 0);
    registers.set_tag(Tag::Run, 1);

    let report = plant.tick().unwrap();
    assert!(plant.deferred_writes().is_empty());
    // Nothing held back is replayed over the master's values
    assert_eq!(report.register_writes.first(), Some(&(Tag::Motor, 0)));
    if !report.reactions.contains(&Reaction::LevelReached) {
        assert_eq!(registers.tag(Tag::Nozzle), 1);
        assert_eq!(registers.tag(Tag::LimitSwitch), 1);
        assert_eq!(registers.tag(Tag::LevelSensor), 0);
    }
}

#[test]
fn test_droplet_rate_bound() {
    let mut plant = Plant::from_config(&config(Consistency::PerAddress)).unwrap();
    let registers = Arc::clone(plant.registers());
    registers.set_tag(Tag::Run, 1);

    let mut nozzle_open_ticks = 0;
    let mut spawned = 0;
    for _ in 0..1500 {
        let nozzle_open = registers.tag(Tag::Nozzle) == 1;
        let report = plant.tick().unwrap();
        if nozzle_open {
            nozzle_open_ticks += 1;
        }
        if report.spawned_droplet.is_some() {
            assert!(nozzle_open, "droplet spawned with the nozzle shut at tick {}", report.tick);
            spawned += 1;
        }
    }

    assert!(spawned > 0);
    assert!(spawned <= nozzle_open_ticks);
    assert_eq!(plant.stats().droplets_spawned, spawned);
}

#[test]
fn test_same_seed_same_run() {
    let run = || {
        let mut config = config(Consistency::PerAddress);
        config.simulation.start_running = true;
        config.simulation.seed = 1234;
        let mut plant = Plant::from_config(&config).unwrap();
        for _ in 0..1000 {
            plant.tick().unwrap();
        }
        let positions: Vec<_> = plant
            .bottles()
            .iter()
            .map(|bottle| plant.bottle_position(bottle.id))
            .collect();
        (plant.stats(), positions, plant.registers().snapshot())
    };

    assert_eq!(run(), run());
}

#[test]
fn test_snapshot_reads_never_mix_ticks() {
    let mut config = config(Consistency::TickSnapshot);
    config.simulation.start_running = true;
    let mut plant = Plant::from_config(&config).unwrap();
    let registers = Arc::clone(plant.registers());
    let stop = Arc::new(AtomicBool::new(false));

    let reader = {
        let registers = Arc::clone(&registers);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut reads = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let values = registers.get(Tag::LimitSwitch.address(), 2).unwrap();
                // No tick ends with the bottle both arriving and full
                assert!(
                    !(values[0] == 1 && values[1] == 1),
                    "mixed read {values:?}"
                );
                reads += 1;
            }
            reads
        })
    };

    for _ in 0..TICK_BUDGET {
        plant.tick().unwrap();
        if plant.stats().bottles_filled == 2 {
            break;
        }
    }
    stop.store(true, Ordering::Relaxed);

    assert!(reader.join().unwrap() > 0);
    assert_eq!(plant.stats().bottles_filled, 2);
}
