//! Error taxonomy for the plant runtime

use thiserror::Error;

use crate::entity::EntityId;
use crate::registers::RegisterError;

/// Faults raised by the plant
///
/// Multi-register reads that straddle a scan cycle are *not* errors: the
/// register map only promises per-address consistency unless tick snapshots
/// are enabled (see [`crate::registers::Consistency`]).
#[derive(Debug, Error)]
pub enum PlantError {
    /// Invalid listen address, unusable parameters or a bank too small to
    /// hold the reserved registers. Fatal at startup.
    #[error("configuration fault: {0}")]
    Configuration(String),

    /// A live entity reached a state the physical model cannot continue from.
    /// The scan cycle stops; there is no recovery state.
    #[error("simulation fault on {entity}: {detail}")]
    Simulation { entity: EntityId, detail: String },

    #[error(transparent)]
    Register(#[from] RegisterError),
}

impl PlantError {
    pub fn simulation(entity: EntityId, detail: impl Into<String>) -> Self {
        PlantError::Simulation {
            entity,
            detail: detail.into(),
        }
    }
}
