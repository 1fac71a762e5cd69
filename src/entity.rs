//! Physical objects of the bottling line
//!
//! Sensors are stationary for the life of the process. Bottles and droplets
//! are created and destroyed by [`crate::lifecycle::Lifecycle`]; their motion
//! and contacts are delegated to [`crate::physics::PhysicsWorld`].

use std::fmt;

use glam::Vec2;
use rapier2d::prelude::{ColliderHandle, RigidBodyHandle};

/// Classification of a collider for contact dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollisionType {
    LimitSwitch,
    LevelSensor,
    BottleInletSensor,
    BottleBottom,
    BottleSide,
    LiquidDroplet,
    Ground,
    ActuatorVisual,
}

impl CollisionType {
    pub const ALL: [CollisionType; 8] = [
        CollisionType::LimitSwitch,
        CollisionType::LevelSensor,
        CollisionType::BottleInletSensor,
        CollisionType::BottleBottom,
        CollisionType::BottleSide,
        CollisionType::LiquidDroplet,
        CollisionType::Ground,
        CollisionType::ActuatorVisual,
    ];

    /// Tag stored in a collider's `user_data`; 0 is left for untagged colliders
    pub fn user_data(self) -> u128 {
        self as u128 + 1
    }

    pub fn from_user_data(data: u128) -> Option<Self> {
        let index = usize::try_from(data.checked_sub(1)?).ok()?;
        Self::ALL.get(index).copied()
    }

    pub fn sensor_kind(self) -> Option<SensorKind> {
        match self {
            CollisionType::LimitSwitch => Some(SensorKind::LimitSwitch),
            CollisionType::LevelSensor => Some(SensorKind::LevelSensor),
            CollisionType::BottleInletSensor => Some(SensorKind::BottleInlet),
            _ => None,
        }
    }

    pub fn is_sensor(self) -> bool {
        self.sensor_kind().is_some()
    }

    pub fn name(self) -> &'static str {
        match self {
            CollisionType::LimitSwitch => "limit-switch",
            CollisionType::LevelSensor => "level-sensor",
            CollisionType::BottleInletSensor => "bottle-inlet-sensor",
            CollisionType::BottleBottom => "bottle-bottom",
            CollisionType::BottleSide => "bottle-side",
            CollisionType::LiquidDroplet => "liquid-droplet",
            CollisionType::Ground => "ground",
            CollisionType::ActuatorVisual => "actuator-visual",
        }
    }
}

impl fmt::Display for CollisionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Detection zones that report contacts but never push back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    LimitSwitch,
    LevelSensor,
    BottleInlet,
}

impl SensorKind {
    pub const ALL: [SensorKind; 3] = [
        SensorKind::LimitSwitch,
        SensorKind::LevelSensor,
        SensorKind::BottleInlet,
    ];

    pub fn collision_type(self) -> CollisionType {
        match self {
            SensorKind::LimitSwitch => CollisionType::LimitSwitch,
            SensorKind::LevelSensor => CollisionType::LevelSensor,
            SensorKind::BottleInlet => CollisionType::BottleInletSensor,
        }
    }

    pub fn position(self) -> Vec2 {
        match self {
            SensorKind::LimitSwitch => layout::LIMIT_SWITCH,
            SensorKind::LevelSensor => layout::LEVEL_SENSOR,
            SensorKind::BottleInlet => layout::BOTTLE_INLET_SENSOR,
        }
    }
}

/// Identifier of a dynamically created entity, unique within one plant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u64);

impl EntityId {
    /// Get the raw u64 value (also stored in the body's `user_data`)
    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn from_raw(id: u64) -> Self {
        EntityId(id)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({})", self.0)
    }
}

/// Hands out [`EntityId`]s in creation order
#[derive(Debug)]
pub struct EntityIds {
    next: u64,
}

impl EntityIds {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn allocate(&mut self) -> EntityId {
        let id = EntityId(self.next);
        self.next += 1;
        id
    }
}

impl Default for EntityIds {
    fn default() -> Self {
        Self::new()
    }
}

/// A bottle: bottom and two side walls moving as one kinematic body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bottle {
    pub id: EntityId,
    pub body: RigidBodyHandle,
}

/// A falling particle of dispensed liquid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Droplet {
    pub id: EntityId,
    pub body: RigidBodyHandle,
}

/// A stationary detection zone
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sensor {
    pub kind: SensorKind,
    pub collider: ColliderHandle,
    pub position: Vec2,
}

/// Geometry and material constants of the line, in pixels with y pointing up
pub mod layout {
    use glam::Vec2;

    /// Body origin of a bottle placed at the conveyor inlet
    pub const BOTTLE_INLET: Vec2 = Vec2::new(130.0, 301.0);
    /// Bottom edge of a bottle, relative to its body origin
    pub const BOTTLE_LEFT: f32 = -150.0;
    pub const BOTTLE_RIGHT: f32 = -100.0;
    pub const BOTTLE_WALL_HEIGHT: f32 = 100.0;
    /// Half thickness of the glass walls
    pub const GLASS_RADIUS: f32 = 2.0;
    pub const GLASS_FRICTION: f32 = 0.94;

    pub const DROPLET_RADIUS: f32 = 3.0;
    pub const DROPLET_MASS: f32 = 0.01;
    /// Droplets leave the nozzle at a whole-pixel x in this range
    pub const DISPENSE_X_MIN: i32 = 181;
    pub const DISPENSE_X_MAX: i32 = 182;
    pub const DISPENSE_Y: f32 = 400.0;

    pub const LIMIT_SWITCH: Vec2 = Vec2::new(200.0, 300.0);
    pub const LEVEL_SENSOR: Vec2 = Vec2::new(155.0, 380.0);
    pub const BOTTLE_INLET_SENSOR: Vec2 = Vec2::new(40.0, 300.0);
    pub const SENSOR_RADIUS: f32 = 5.0;

    /// Conveyor belt surface
    pub const BASE_Y: f32 = 300.0;
    pub const BASE_RADIUS: f32 = 2.0;
    pub const BASE_FRICTION: f32 = 1.0;
    pub const BASE_RESTITUTION: f32 = 0.95;

    /// Nozzle housing above the fill point (visual only)
    pub const NOZZLE_CENTER: Vec2 = Vec2::new(180.0, 415.0);
    pub const NOZZLE_HALF_EXTENTS: Vec2 = Vec2::new(10.0, 15.0);

    pub const GRAVITY: f32 = -900.0;
}
