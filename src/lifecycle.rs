//! Creation and removal of bottles and droplets

use glam::Vec2;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;

use crate::config::WorkspaceConfig;
use crate::entity::{layout, Bottle, Droplet, EntityId, EntityIds};
use crate::error::PlantError;
use crate::physics::PhysicsWorld;

/// Droplet spawn counter of the filling nozzle
///
/// The counter runs down by one per call and saturates at zero. A droplet
/// leaves the nozzle only when it is zero and the nozzle is open, after which
/// it restarts from the interval, so at most one droplet spawns per tick.
#[derive(Debug, Clone)]
pub struct Dispenser {
    countdown: u32,
    interval: u32,
    rng: Xoshiro256StarStar,
}

impl Dispenser {
    pub fn new(interval: u32, seed: u64) -> Self {
        let interval = interval.max(1);
        Self {
            countdown: interval,
            interval,
            rng: Xoshiro256StarStar::seed_from_u64(seed),
        }
    }

    /// Advance one tick; returns where a droplet should appear
    pub fn tick(&mut self, nozzle_open: bool) -> Option<Vec2> {
        self.countdown = self.countdown.saturating_sub(1);
        if self.countdown > 0 || !nozzle_open {
            return None;
        }
        self.countdown = self.interval;

        let x = self
            .rng
            .random_range(layout::DISPENSE_X_MIN..=layout::DISPENSE_X_MAX);
        Some(Vec2::new(x as f32, layout::DISPENSE_Y))
    }

    pub fn countdown(&self) -> u32 {
        self.countdown
    }
}

/// Entities removed by one eviction pass, in live-list order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Eviction {
    pub bottles: Vec<EntityId>,
    pub droplets: Vec<EntityId>,
}

impl Eviction {
    pub fn is_empty(&self) -> bool {
        self.bottles.is_empty() && self.droplets.is_empty()
    }
}

/// Live set of bottles and droplets
///
/// Every live entity owns exactly one physics body. Spawning inserts both
/// and eviction removes both within the same call, so the live lists and the
/// physics world never disagree between ticks.
pub struct Lifecycle {
    bottles: Vec<Bottle>,
    droplets: Vec<Droplet>,
    ids: EntityIds,
    dispenser: Dispenser,
    workspace: WorkspaceConfig,
}

impl Lifecycle {
    pub fn new(workspace: WorkspaceConfig, dispenser: Dispenser) -> Self {
        Self {
            bottles: Vec::new(),
            droplets: Vec::new(),
            ids: EntityIds::new(),
            dispenser,
            workspace,
        }
    }

    /// Place a new bottle at the conveyor inlet
    pub fn spawn_bottle(&mut self, physics: &mut PhysicsWorld) -> EntityId {
        let id = self.ids.allocate();
        let body = physics.add_bottle(id, layout::BOTTLE_INLET);
        self.bottles.push(Bottle { id, body });
        log::debug!("Lifecycle: spawned bottle {}", id);
        id
    }

    /// Run the dispenser for one tick, spawning a droplet if it fires
    pub fn dispense(&mut self, nozzle_open: bool, physics: &mut PhysicsWorld) -> Option<EntityId> {
        let position = self.dispenser.tick(nozzle_open)?;
        let id = self.ids.allocate();
        let body = physics.add_droplet(id, position);
        self.droplets.push(Droplet { id, body });
        Some(id)
    }

    /// Move every live bottle along the conveyor
    pub fn advance_bottles(&self, step: f32, physics: &mut PhysicsWorld) -> Result<(), PlantError> {
        let delta = Vec2::new(step, 0.0);
        for bottle in &self.bottles {
            if !physics.translate_kinematic(bottle.body, delta) {
                return Err(PlantError::simulation(bottle.id, "bottle has no physics body"));
            }
        }
        Ok(())
    }

    /// Check every live body for a state the model cannot continue from
    pub fn validate(&self, physics: &PhysicsWorld) -> Result<(), PlantError> {
        let bodies = self
            .bottles
            .iter()
            .map(|b| (b.id, b.body))
            .chain(self.droplets.iter().map(|d| (d.id, d.body)));

        for (id, body) in bodies {
            let Some(state) = physics.body_state(body) else {
                return Err(PlantError::simulation(id, "physics body missing"));
            };
            if !state.is_finite() {
                return Err(PlantError::simulation(
                    id,
                    format!(
                        "non-finite state: position {:?}, velocity {:?}",
                        state.position, state.velocity
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Remove every bottle and droplet outside the workspace
    ///
    /// Survivors keep their order and positions.
    pub fn evict(&mut self, physics: &mut PhysicsWorld) -> Eviction {
        let workspace = self.workspace;
        let mut eviction = Eviction::default();

        self.bottles.retain(|bottle| {
            let inside = physics
                .position(bottle.body)
                .map_or(true, |position| workspace.contains(position));
            if !inside {
                physics.remove_body(bottle.body);
                eviction.bottles.push(bottle.id);
            }
            inside
        });

        self.droplets.retain(|droplet| {
            let inside = physics
                .position(droplet.body)
                .map_or(true, |position| workspace.contains(position));
            if !inside {
                physics.remove_body(droplet.body);
                eviction.droplets.push(droplet.id);
            }
            inside
        });

        if !eviction.bottles.is_empty() {
            log::debug!("Lifecycle: evicted bottles {:?}", eviction.bottles);
        }
        eviction
    }

    pub fn bottles(&self) -> &[Bottle] {
        &self.bottles
    }

    pub fn droplets(&self) -> &[Droplet] {
        &self.droplets
    }

    pub fn workspace(&self) -> &WorkspaceConfig {
        &self.workspace
    }
}
