use std::time::Duration;

use thiserror::Error;

/// Error kinds surfaced by the core filter. `InvalidInput` and
/// `LoadTimeout` are fatal to the caller; the rest are recovered locally by
/// the driver and only ever observed through logging.
#[derive(Debug, Error)]
pub enum ArmclError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("missing kinematics for map_id {map_id}")]
    MissingKinematics { map_id: usize },

    #[error("sample set is degenerate: total weight is zero")]
    Degeneracy,

    #[error("observation at t={t} is not newer than last accepted t={last}")]
    Stale { t: f64, last: f64 },

    #[error("map loader did not finish within {0:?}")]
    LoadTimeout(Duration),
}

pub type Result<T> = std::result::Result<T, ArmclError>;
