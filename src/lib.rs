//! # Bottling PLC - simulated bottle-filling line
//!
//! A conveyor carries bottles under a filling nozzle. Sensors, motor and
//! valve are holding registers of a Modbus/TCP slave, so an external master
//! can watch and drive the line as it would a real controller.

pub mod config;
pub mod control;
pub mod dispatch;
pub mod entity;
pub mod error;
pub mod fieldbus;
pub mod lifecycle;
pub mod physics;
pub mod plant;
pub mod registers;

pub use config::PlantConfig;
pub use control::{ControlLoop, Shutdown};
pub use error::PlantError;
pub use plant::Plant;

/// Common imports for internal use
pub mod prelude {
    pub use crate::dispatch::{ContactEvent, Reaction};
    pub use crate::entity::{CollisionType, EntityId};
    pub use crate::plant::{ControlState, TickReport};
    pub use crate::registers::{Consistency, RegisterMap, Tag, Word};
    pub use glam::Vec2;
}
