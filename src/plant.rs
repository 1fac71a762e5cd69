//! The bottling line and its scan cycle
//!
//! [`Plant`] owns everything the scan cycle touches: the physics world, the
//! live entities, the sensors and a handle to the shared register map. One
//! call to [`Plant::tick`] is one scan cycle:
//!
//! 1. Sample RUN. When it is 0 the plant is STOPPED and skips to step 5.
//! 2. Apply the motor rules.
//! 3. Run the droplet dispenser against NOZZLE.
//! 4. Advance the bottles if MOTOR is on.
//! 5. Step the physics and dispatch the resulting sensor contacts.
//! 6. Validate every live body, then evict what left the workspace.
//!
//! A STOPPED tick writes no process register. Contact effects it produces are
//! held back and applied at the start of the next RUNNING tick, except on
//! registers a master has written in the meantime.

use std::fmt;
use std::sync::Arc;

use glam::Vec2;

use crate::config::PlantConfig;
use crate::dispatch::{dispatch, EventSink, Reaction};
use crate::entity::{layout, Bottle, EntityId, Sensor, SensorKind};
use crate::error::PlantError;
use crate::lifecycle::{Dispenser, Eviction, Lifecycle};
use crate::physics::PhysicsWorld;
use crate::registers::{ProcessImage, RegisterMap, ScanRegisters, Tag, Word};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Stopped,
    Running,
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlState::Stopped => write!(f, "STOPPED"),
            ControlState::Running => write!(f, "RUNNING"),
        }
    }
}

/// What happened during one tick
#[derive(Debug, Clone)]
pub struct TickReport {
    /// 1-based index of the tick
    pub tick: u64,
    pub state: ControlState,
    /// Process register writes made by the loop, in order
    pub register_writes: Vec<(Tag, Word)>,
    /// Contact reactions other than ignore
    pub reactions: Vec<Reaction>,
    pub spawned_bottles: Vec<EntityId>,
    pub spawned_droplet: Option<EntityId>,
    pub eviction: Eviction,
}

impl TickReport {
    fn new(tick: u64, state: ControlState) -> Self {
        Self {
            tick,
            state,
            register_writes: Vec::new(),
            reactions: Vec::new(),
            spawned_bottles: Vec::new(),
            spawned_droplet: None,
            eviction: Eviction::default(),
        }
    }

    /// Final value written to `tag` this tick, if any
    pub fn written(&self, tag: Tag) -> Option<Word> {
        self.register_writes
            .iter()
            .rev()
            .find(|(t, _)| *t == tag)
            .map(|&(_, value)| value)
    }
}

/// Running totals of the plant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlantStats {
    pub ticks: u64,
    pub running_ticks: u64,
    pub bottles_spawned: u64,
    pub bottles_filled: u64,
    pub bottles_shipped: u64,
    pub droplets_spawned: u64,
    pub droplets_evicted: u64,
}

impl fmt::Display for PlantStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ticks ({} running), bottles: {} spawned / {} filled / {} shipped, droplets: {} spawned / {} evicted",
            self.ticks,
            self.running_ticks,
            self.bottles_spawned,
            self.bottles_filled,
            self.bottles_shipped,
            self.droplets_spawned,
            self.droplets_evicted
        )
    }
}

/// Conveyor motor rules, applied in this order every RUNNING tick
///
/// The last rule wins: without a bottle at the limit switch the conveyor
/// always runs, even if the first rule just stopped it.
pub fn apply_motor_rules(image: &mut impl ProcessImage) {
    if image.is_on(Tag::LimitSwitch) {
        image.set(Tag::Motor, 0);
    }
    if image.is_on(Tag::LevelSensor) {
        image.set(Tag::Motor, 1);
    }
    if image.get(Tag::LimitSwitch) == 0 {
        image.set(Tag::Motor, 1);
    }
}

/// Contact write held back during a STOPPED tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeferredWrite {
    tag: Tag,
    value: Word,
    /// Register revision when the contact happened
    revision: u64,
}

/// Receives dispatched contact effects during a tick
struct TickSink<'s, 'a> {
    scan: &'s mut ScanRegisters<'a>,
    /// Present while STOPPED: writes are held back here
    deferred: Option<&'s mut Vec<DeferredWrite>>,
    bottle_requests: usize,
}

impl EventSink for TickSink<'_, '_> {
    fn write_register(&mut self, tag: Tag, value: Word) {
        match &mut self.deferred {
            Some(deferred) => {
                // Writes are overwrites; only the latest per register matters
                deferred.retain(|write| write.tag != tag);
                deferred.push(DeferredWrite {
                    tag,
                    value,
                    revision: self.scan.revision(tag),
                });
            }
            None => self.scan.set(tag, value),
        }
    }

    fn request_bottle(&mut self) {
        self.bottle_requests += 1;
    }
}

/// Simulation context of the bottling line
pub struct Plant {
    registers: Arc<RegisterMap>,
    physics: PhysicsWorld,
    lifecycle: Lifecycle,
    sensors: Vec<Sensor>,
    conveyor_step: f32,
    deferred: Vec<DeferredWrite>,
    /// A bottle is at the limit switch and has not been filled yet
    filling: bool,
    stats: PlantStats,
}

impl Plant {
    /// Build the line with one bottle at the inlet
    pub fn new(config: &PlantConfig, registers: Arc<RegisterMap>) -> Result<Self, PlantError> {
        config.validate()?;
        if registers.size() < Tag::required_bank_size() {
            return Err(PlantError::Configuration(format!(
                "register bank of {} cannot hold RUN at 0x{:x}",
                registers.size(),
                Tag::Run.address()
            )));
        }

        let sim = &config.simulation;
        let mut physics = PhysicsWorld::new(sim.dt(), sim.gravity);
        physics.add_ground(config.workspace.width);
        physics.add_actuator_visual(layout::NOZZLE_CENTER, layout::NOZZLE_HALF_EXTENTS);

        let sensors = SensorKind::ALL
            .into_iter()
            .map(|kind| Sensor {
                kind,
                collider: physics.add_sensor(kind),
                position: kind.position(),
            })
            .collect();

        let dispenser = Dispenser::new(sim.droplet_spawn_interval, sim.seed);
        let mut lifecycle = Lifecycle::new(config.workspace, dispenser);
        lifecycle.spawn_bottle(&mut physics);

        if sim.start_running {
            registers.set_tag(Tag::Run, 1);
        }

        log::info!(
            "Plant: line ready, {} Hz, conveyor step {}, {} registers ({:?})",
            sim.tick_rate_hz,
            sim.conveyor_step,
            registers.size(),
            registers.consistency()
        );

        Ok(Self {
            registers,
            physics,
            lifecycle,
            sensors,
            conveyor_step: sim.conveyor_step,
            deferred: Vec::new(),
            filling: false,
            stats: PlantStats {
                bottles_spawned: 1,
                ..Default::default()
            },
        })
    }

    /// Build the line together with a fresh register map
    pub fn from_config(config: &PlantConfig) -> Result<Self, PlantError> {
        let registers = RegisterMap::new(config.registers.bank_size, config.registers.consistency)?;
        Self::new(config, Arc::new(registers))
    }

    /// Run one scan cycle
    pub fn tick(&mut self) -> Result<TickReport, PlantError> {
        self.stats.ticks += 1;
        let registers = Arc::clone(&self.registers);
        let mut scan = ScanRegisters::begin(&registers);

        let state = if scan.is_on(Tag::Run) {
            ControlState::Running
        } else {
            ControlState::Stopped
        };
        let mut report = TickReport::new(self.stats.ticks, state);

        if state == ControlState::Running {
            self.stats.running_ticks += 1;

            for write in self.deferred.drain(..) {
                if scan.revision(write.tag) == write.revision {
                    scan.set(write.tag, write.value);
                } else {
                    log::debug!(
                        "Plant: dropped held-back {}={}, written by a master since",
                        write.tag,
                        write.value
                    );
                }
            }

            apply_motor_rules(&mut scan);

            if let Some(id) = self.lifecycle.dispense(scan.is_on(Tag::Nozzle), &mut self.physics) {
                self.stats.droplets_spawned += 1;
                report.spawned_droplet = Some(id);
            }

            if scan.is_on(Tag::Motor) {
                self.lifecycle
                    .advance_bottles(self.conveyor_step, &mut self.physics)?;
            }
        }

        let contacts = self.physics.step();

        let mut sink = TickSink {
            scan: &mut scan,
            deferred: match state {
                ControlState::Running => None,
                ControlState::Stopped => Some(&mut self.deferred),
            },
            bottle_requests: 0,
        };
        for event in &contacts {
            let reaction = dispatch(event, &mut sink);
            if reaction != Reaction::Ignore {
                report.reactions.push(reaction);
            }
        }
        let bottle_requests = sink.bottle_requests;

        for reaction in &report.reactions {
            match reaction {
                Reaction::BottleInPlace => self.filling = true,
                Reaction::LevelReached if self.filling => {
                    self.filling = false;
                    self.stats.bottles_filled += 1;
                    log::info!("Plant: bottle filled ({} so far)", self.stats.bottles_filled);
                }
                _ => {}
            }
        }

        for _ in 0..bottle_requests {
            report
                .spawned_bottles
                .push(self.lifecycle.spawn_bottle(&mut self.physics));
            self.stats.bottles_spawned += 1;
        }

        self.lifecycle.validate(&self.physics)?;

        report.eviction = self.lifecycle.evict(&mut self.physics);
        self.stats.bottles_shipped += report.eviction.bottles.len() as u64;
        self.stats.droplets_evicted += report.eviction.droplets.len() as u64;
        for id in &report.eviction.bottles {
            log::info!("Plant: bottle {} left the line", id);
        }

        report.register_writes = scan.commit();

        log::trace!(
            "Tick {} {}: LIMIT={} LEVEL={} MOTOR={} NOZZLE={} bottles={} droplets={}",
            report.tick,
            state,
            self.registers.tag(Tag::LimitSwitch),
            self.registers.tag(Tag::LevelSensor),
            self.registers.tag(Tag::Motor),
            self.registers.tag(Tag::Nozzle),
            self.lifecycle.bottles().len(),
            self.lifecycle.droplets().len()
        );

        Ok(report)
    }

    pub fn registers(&self) -> &Arc<RegisterMap> {
        &self.registers
    }

    /// State the next tick will run in, unless RUN changes first
    pub fn control_state(&self) -> ControlState {
        if self.registers.tag(Tag::Run) == 1 {
            ControlState::Running
        } else {
            ControlState::Stopped
        }
    }

    pub fn bottles(&self) -> &[Bottle] {
        self.lifecycle.bottles()
    }

    pub fn bottle_position(&self, id: EntityId) -> Option<Vec2> {
        self.bottles()
            .iter()
            .find(|bottle| bottle.id == id)
            .and_then(|bottle| self.physics.position(bottle.body))
    }

    pub fn droplet_count(&self) -> usize {
        self.lifecycle.droplets().len()
    }

    pub fn sensors(&self) -> &[Sensor] {
        &self.sensors
    }

    /// Contact writes held back while STOPPED
    pub fn deferred_writes(&self) -> Vec<(Tag, Word)> {
        self.deferred
            .iter()
            .map(|write| (write.tag, write.value))
            .collect()
    }

    pub fn stats(&self) -> PlantStats {
        self.stats
    }

    pub fn ticks(&self) -> u64 {
        self.stats.ticks
    }

    /// Remove a bottle's physics body while the lifecycle still tracks it
    #[cfg(test)]
    pub(crate) fn detach_bottle_body(&mut self, id: EntityId) -> bool {
        let body = self
            .lifecycle
            .bottles()
            .iter()
            .find(|bottle| bottle.id == id)
            .map(|bottle| bottle.body);
        body.is_some_and(|body| self.physics.remove_body(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::Consistency;

    /// Process image whose LIMIT_SWITCH reads follow a script
    struct Scripted {
        limit_switch: Vec<Word>,
        level_sensor: Word,
        motor: Word,
        motor_writes: Vec<Word>,
    }

    impl ProcessImage for Scripted {
        fn get(&self, tag: Tag) -> Word {
            match tag {
                Tag::LimitSwitch => self.limit_switch[0],
                Tag::LevelSensor => self.level_sensor,
                Tag::Motor => self.motor,
                _ => 0,
            }
        }

        fn set(&mut self, tag: Tag, value: Word) {
            if tag == Tag::Motor {
                self.motor = value;
                self.motor_writes.push(value);
                // A master clears the switch between two rule evaluations
                if self.limit_switch.len() > 1 {
                    self.limit_switch.remove(0);
                }
            }
        }
    }

    #[test]
    fn test_motor_rules() {
        let map = RegisterMap::new(100, Consistency::PerAddress).unwrap();

        let mut scan = ScanRegisters::begin(&map);
        apply_motor_rules(&mut scan);
        assert_eq!(map.tag(Tag::Motor), 1);

        map.set_tag(Tag::LimitSwitch, 1);
        let mut scan = ScanRegisters::begin(&map);
        apply_motor_rules(&mut scan);
        assert_eq!(map.tag(Tag::Motor), 0);

        map.set_tag(Tag::LevelSensor, 1);
        let mut scan = ScanRegisters::begin(&map);
        apply_motor_rules(&mut scan);
        assert_eq!(scan.writes(), &[(Tag::Motor, 0), (Tag::Motor, 1)]);
        assert_eq!(map.tag(Tag::Motor), 1);
    }

    #[test]
    fn test_limit_switch_cleared_mid_rules_runs_motor() {
        let mut image = Scripted {
            limit_switch: vec![1, 0],
            level_sensor: 0,
            motor: 1,
            motor_writes: Vec::new(),
        };
        apply_motor_rules(&mut image);
        assert_eq!(image.motor_writes, vec![0, 1]);
        assert_eq!(image.motor, 1);
    }

    #[test]
    fn test_initial_line() {
        let plant = Plant::from_config(&PlantConfig::default()).unwrap();
        assert_eq!(plant.bottles().len(), 1);
        assert_eq!(plant.sensors().len(), 3);
        assert_eq!(plant.control_state(), ControlState::Stopped);
        let id = plant.bottles()[0].id;
        assert_eq!(plant.bottle_position(id), Some(layout::BOTTLE_INLET));
        assert_eq!(plant.stats().bottles_spawned, 1);
    }

    #[test]
    fn test_start_running_presets_run() {
        let mut config = PlantConfig::default();
        config.simulation.start_running = true;
        let plant = Plant::from_config(&config).unwrap();
        assert_eq!(plant.registers().tag(Tag::Run), 1);
        assert_eq!(plant.control_state(), ControlState::Running);
    }

    #[test]
    fn test_stopped_ticks_write_nothing() {
        let mut plant = Plant::from_config(&PlantConfig::default()).unwrap();
        let id = plant.bottles()[0].id;
        for _ in 0..100 {
            let report = plant.tick().unwrap();
            assert_eq!(report.state, ControlState::Stopped);
            assert!(report.register_writes.is_empty());
            assert!(report.spawned_droplet.is_none());
        }
        for tag in [Tag::LimitSwitch, Tag::LevelSensor, Tag::Motor, Tag::Nozzle] {
            assert_eq!(plant.registers().tag(tag), 0, "{tag}");
        }
        assert_eq!(plant.bottle_position(id), Some(layout::BOTTLE_INLET));
    }

    #[test]
    fn test_stopped_contact_writes_are_deferred() {
        let map = RegisterMap::new(100, Consistency::PerAddress).unwrap();
        let mut scan = ScanRegisters::begin(&map);
        let mut deferred = Vec::new();
        let mut sink = TickSink {
            scan: &mut scan,
            deferred: Some(&mut deferred),
            bottle_requests: 0,
        };
        sink.write_register(Tag::LimitSwitch, 1);
        sink.write_register(Tag::Nozzle, 1);
        map.set_tag(Tag::LimitSwitch, 1);
        sink.write_register(Tag::LimitSwitch, 0);
        assert!(scan.writes().is_empty());
        let held: Vec<_> = deferred
            .iter()
            .map(|w| (w.tag, w.value, w.revision))
            .collect();
        assert_eq!(held, vec![(Tag::Nozzle, 1, 0), (Tag::LimitSwitch, 0, 1)]);
        assert_eq!(map.tag(Tag::Nozzle), 0);
    }

    /// Held-back write recorded against the current register revision
    fn held(plant: &Plant, tag: Tag, value: Word) -> DeferredWrite {
        DeferredWrite {
            tag,
            value,
            revision: plant.registers().revision(tag),
        }
    }

    #[test]
    fn test_deferred_writes_apply_before_motor_rules() {
        let mut plant = Plant::from_config(&PlantConfig::default()).unwrap();
        plant.deferred = vec![
            held(&plant, Tag::LimitSwitch, 1),
            held(&plant, Tag::Nozzle, 1),
        ];

        plant.tick().unwrap();
        assert_eq!(plant.deferred_writes().len(), 2);

        plant.registers().set_tag(Tag::Run, 1);
        let report = plant.tick().unwrap();
        assert!(plant.deferred_writes().is_empty());
        assert_eq!(
            &report.register_writes[..3],
            &[(Tag::LimitSwitch, 1), (Tag::Nozzle, 1), (Tag::Motor, 0)]
        );
        // Nozzle open and counter run down: one droplet this tick
        assert!(report.spawned_droplet.is_some());
        assert_eq!(plant.registers().tag(Tag::Motor), 0);
    }

    #[test]
    fn test_master_write_beats_held_back_contact() {
        for consistency in [Consistency::PerAddress, Consistency::TickSnapshot] {
            let mut config = PlantConfig::default();
            config.registers.consistency = consistency;
            let mut plant = Plant::from_config(&config).unwrap();
            let registers = Arc::clone(plant.registers());

            // Mid-fill when the line was stopped
            registers.set_tag(Tag::LimitSwitch, 1);
            registers.set_tag(Tag::Nozzle, 1);

            // The level sensor fired during the stop
            plant.deferred = vec![
                held(&plant, Tag::LimitSwitch, 0),
                held(&plant, Tag::LevelSensor, 1),
                held(&plant, Tag::Nozzle, 0),
            ];

            // The master then forces the line, rewriting values it already
            // held, and restarts it
            registers.set_tag(Tag::Nozzle, 1);
            registers.set_tag(Tag::LimitSwitch, 1);
            registers.set_tag(Tag::LevelSensor, 0);
            registers.set_tag(Tag::Run, 1);

            let report = plant.tick().unwrap();
            assert!(plant.deferred_writes().is_empty());
            assert_eq!(report.written(Tag::Nozzle), None);
            assert_eq!(report.written(Tag::LimitSwitch), None);
            assert_eq!(report.written(Tag::LevelSensor), None);
            assert_eq!(report.written(Tag::Motor), Some(0));
            assert_eq!(registers.tag(Tag::Nozzle), 1, "{consistency:?}");
            assert_eq!(registers.tag(Tag::LimitSwitch), 1);
            assert_eq!(registers.tag(Tag::LevelSensor), 0);
        }
    }

    #[test]
    fn test_held_back_contact_applies_to_untouched_registers() {
        let mut plant = Plant::from_config(&PlantConfig::default()).unwrap();
        let registers = Arc::clone(plant.registers());
        registers.set_tag(Tag::Nozzle, 1);
        plant.deferred = vec![
            held(&plant, Tag::LevelSensor, 1),
            held(&plant, Tag::Nozzle, 0),
        ];

        // Only NOZZLE is rewritten by the master
        registers.set_tag(Tag::Nozzle, 1);
        registers.set_tag(Tag::Run, 1);

        let report = plant.tick().unwrap();
        assert_eq!(report.register_writes[0], (Tag::LevelSensor, 1));
        assert_eq!(report.written(Tag::Nozzle), None);
        assert_eq!(registers.tag(Tag::LevelSensor), 1);
        assert_eq!(registers.tag(Tag::Nozzle), 1);
    }

    #[test]
    fn test_running_moves_bottle_by_step() {
        let mut config = PlantConfig::default();
        config.simulation.start_running = true;
        let mut plant = Plant::from_config(&config).unwrap();
        let id = plant.bottles()[0].id;
        for _ in 0..40 {
            let report = plant.tick().unwrap();
            assert_eq!(report.written(Tag::Motor), Some(1));
        }
        let position = plant.bottle_position(id).unwrap();
        assert!((position.x - (layout::BOTTLE_INLET.x + 40.0 * 0.25)).abs() < 1e-3);
    }
}
