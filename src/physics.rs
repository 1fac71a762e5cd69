//! Rigid body physics for the bottling line

use std::sync::{Mutex, MutexGuard};

use glam::Vec2;
use rapier2d::prelude::*;

use crate::dispatch::{ContactEvent, ContactPhase};
use crate::entity::{layout, CollisionType, EntityId, SensorKind};

/// Position and velocity of a body after the last step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodyState {
    pub position: Vec2,
    pub velocity: Vec2,
}

impl BodyState {
    pub fn is_finite(&self) -> bool {
        self.position.is_finite() && self.velocity.is_finite()
    }
}

/// Collects sensor contacts reported during a step
#[derive(Default)]
struct ContactCollector {
    events: Mutex<Vec<ContactEvent>>,
}

impl ContactCollector {
    fn events(&self) -> MutexGuard<'_, Vec<ContactEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn drain(&self) -> Vec<ContactEvent> {
        std::mem::take(&mut *self.events())
    }
}

fn collision_type(colliders: &ColliderSet, handle: ColliderHandle) -> Option<CollisionType> {
    colliders
        .get(handle)
        .and_then(|collider| CollisionType::from_user_data(collider.user_data))
}

impl EventHandler for ContactCollector {
    fn handle_collision_event(
        &self,
        _bodies: &RigidBodySet,
        colliders: &ColliderSet,
        event: CollisionEvent,
        _contact_pair: Option<&ContactPair>,
    ) {
        // Deleting a collider ends its contacts; that is not a separation
        if event.removed() {
            return;
        }

        let (Some(first), Some(second)) = (
            collision_type(colliders, event.collider1()),
            collision_type(colliders, event.collider2()),
        ) else {
            log::trace!("Physics: untagged collision {:?}", event);
            return;
        };

        let phase = if event.started() {
            ContactPhase::Began
        } else {
            ContactPhase::Separated
        };

        self.events().push(ContactEvent {
            first,
            second,
            phase,
        });
    }

    fn handle_contact_force_event(
        &self,
        _dt: Real,
        _bodies: &RigidBodySet,
        _colliders: &ColliderSet,
        _contact_pair: &ContactPair,
        _total_force_magnitude: Real,
    ) {
    }
}

/// Manages the rapier2d world of the bottling line
pub struct PhysicsWorld {
    /// Rapier rigid body set
    rigid_body_set: RigidBodySet,

    /// Rapier collider set
    collider_set: ColliderSet,

    /// Physics pipeline
    pipeline: PhysicsPipeline,

    /// Integration parameters
    integration_parameters: IntegrationParameters,

    /// Island manager
    island_manager: IslandManager,

    /// Broad phase
    broad_phase: BroadPhase,

    /// Narrow phase
    narrow_phase: NarrowPhase,

    /// Impulse joint set
    impulse_joint_set: ImpulseJointSet,

    /// Multibody joint set
    multibody_joint_set: MultibodyJointSet,

    /// CCD solver
    ccd_solver: CCDSolver,

    /// Query pipeline
    query_pipeline: QueryPipeline,

    gravity: Vector<Real>,

    contacts: ContactCollector,
}

impl PhysicsWorld {
    /// Create an empty world stepping `dt` seconds at a time
    pub fn new(dt: f32, gravity: f32) -> Self {
        let integration_parameters = IntegrationParameters {
            dt,
            ..Default::default()
        };

        Self {
            rigid_body_set: RigidBodySet::new(),
            collider_set: ColliderSet::new(),
            pipeline: PhysicsPipeline::new(),
            integration_parameters,
            island_manager: IslandManager::new(),
            broad_phase: BroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            impulse_joint_set: ImpulseJointSet::new(),
            multibody_joint_set: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            query_pipeline: QueryPipeline::new(),
            gravity: vector![0.0, gravity],
            contacts: ContactCollector::default(),
        }
    }

    /// Add the conveyor belt surface spanning the workspace
    pub fn add_ground(&mut self, width: f32) -> ColliderHandle {
        let shape = SharedShape::capsule(
            point![0.0, layout::BASE_Y],
            point![width, layout::BASE_Y],
            layout::BASE_RADIUS,
        );
        let ground = ColliderBuilder::new(shape)
            .friction(layout::BASE_FRICTION)
            .restitution(layout::BASE_RESTITUTION)
            .user_data(CollisionType::Ground.user_data())
            .build();

        log::debug!("Physics: Created conveyor base 0..{} at y={}", width, layout::BASE_Y);

        self.collider_set.insert(ground)
    }

    /// Add a stationary detection zone
    ///
    /// Sensors never push back on anything. They report intersections with
    /// dynamic droplets and with the kinematic bottles, which the physics
    /// engine skips against fixed colliders unless asked.
    pub fn add_sensor(&mut self, kind: SensorKind) -> ColliderHandle {
        let position = kind.position();
        let sensor = ColliderBuilder::ball(layout::SENSOR_RADIUS)
            .translation(vector![position.x, position.y])
            .sensor(true)
            .active_events(ActiveEvents::COLLISION_EVENTS)
            .active_collision_types(
                ActiveCollisionTypes::default() | ActiveCollisionTypes::KINEMATIC_FIXED,
            )
            .user_data(kind.collision_type().user_data())
            .build();

        log::debug!("Physics: Created {} sensor at {:?}", kind.collision_type(), position);

        self.collider_set.insert(sensor)
    }

    /// Add the nozzle housing; it is drawn but never touched
    pub fn add_actuator_visual(&mut self, center: Vec2, half_extents: Vec2) -> ColliderHandle {
        let housing = ColliderBuilder::cuboid(half_extents.x, half_extents.y)
            .translation(vector![center.x, center.y])
            .sensor(true)
            .user_data(CollisionType::ActuatorVisual.user_data())
            .build();
        self.collider_set.insert(housing)
    }

    /// Add a bottle whose body origin sits at `origin`
    ///
    /// The conveyor drives bottles directly, so the body is kinematic: it has
    /// no mass or inertia and is moved by setting its next position.
    pub fn add_bottle(&mut self, id: EntityId, origin: Vec2) -> RigidBodyHandle {
        let body = RigidBodyBuilder::kinematic_position_based()
            .translation(vector![origin.x, origin.y])
            .user_data(id.raw() as u128)
            .build();
        let handle = self.rigid_body_set.insert(body);

        let left = layout::BOTTLE_LEFT;
        let right = layout::BOTTLE_RIGHT;
        let top = layout::BOTTLE_WALL_HEIGHT;
        let walls = [
            ((left, 0.0), (right, 0.0), CollisionType::BottleBottom),
            ((left, 0.0), (left, top), CollisionType::BottleSide),
            ((right, 0.0), (right, top), CollisionType::BottleSide),
        ];

        for ((ax, ay), (bx, by), kind) in walls {
            let shape = SharedShape::capsule(point![ax, ay], point![bx, by], layout::GLASS_RADIUS);
            let wall = ColliderBuilder::new(shape)
                .friction(layout::GLASS_FRICTION)
                .user_data(kind.user_data())
                .build();
            self.collider_set
                .insert_with_parent(wall, handle, &mut self.rigid_body_set);
        }

        log::debug!("Physics: Created bottle {} at ({:.1}, {:.1})", id, origin.x, origin.y);

        handle
    }

    /// Add a droplet falling from `position`
    pub fn add_droplet(&mut self, id: EntityId, position: Vec2) -> RigidBodyHandle {
        let body = RigidBodyBuilder::dynamic()
            .translation(vector![position.x, position.y])
            .ccd_enabled(true) // Fast and small: don't tunnel through the glass
            .user_data(id.raw() as u128)
            .build();
        let handle = self.rigid_body_set.insert(body);

        // Liquid does not grip the glass
        let collider = ColliderBuilder::ball(layout::DROPLET_RADIUS)
            .mass(layout::DROPLET_MASS)
            .friction(0.0)
            .friction_combine_rule(CoefficientCombineRule::Min)
            .user_data(CollisionType::LiquidDroplet.user_data())
            .build();
        self.collider_set
            .insert_with_parent(collider, handle, &mut self.rigid_body_set);

        log::trace!("Physics: Created droplet {} at ({:.1}, {:.1})", id, position.x, position.y);

        handle
    }

    /// Move a kinematic body by `delta` during the next step
    ///
    /// Returns false if the body does not exist.
    pub fn translate_kinematic(&mut self, handle: RigidBodyHandle, delta: Vec2) -> bool {
        let Some(body) = self.rigid_body_set.get_mut(handle) else {
            return false;
        };
        let target = body.translation() + vector![delta.x, delta.y];
        body.set_next_kinematic_translation(target);
        true
    }

    /// Remove a body together with its colliders
    pub fn remove_body(&mut self, handle: RigidBodyHandle) -> bool {
        self.rigid_body_set
            .remove(
                handle,
                &mut self.island_manager,
                &mut self.collider_set,
                &mut self.impulse_joint_set,
                &mut self.multibody_joint_set,
                true,
            )
            .is_some()
    }

    pub fn position(&self, handle: RigidBodyHandle) -> Option<Vec2> {
        self.rigid_body_set.get(handle).map(|body| {
            let translation = body.translation();
            Vec2::new(translation.x, translation.y)
        })
    }

    pub fn body_state(&self, handle: RigidBodyHandle) -> Option<BodyState> {
        self.rigid_body_set.get(handle).map(|body| {
            let translation = body.translation();
            let linvel = body.linvel();
            BodyState {
                position: Vec2::new(translation.x, translation.y),
                velocity: Vec2::new(linvel.x, linvel.y),
            }
        })
    }

    /// Advance the world by one step and return the sensor contacts it produced
    pub fn step(&mut self) -> Vec<ContactEvent> {
        let physics_hooks = ();

        self.pipeline.step(
            &self.gravity,
            &self.integration_parameters,
            &mut self.island_manager,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.rigid_body_set,
            &mut self.collider_set,
            &mut self.impulse_joint_set,
            &mut self.multibody_joint_set,
            &mut self.ccd_solver,
            Some(&mut self.query_pipeline),
            &physics_hooks,
            &self.contacts,
        );

        self.contacts.drain()
    }

    /// Get number of bodies in the world
    pub fn body_count(&self) -> usize {
        self.rigid_body_set.len()
    }

    pub fn collider_count(&self) -> usize {
        self.collider_set.len()
    }
}
