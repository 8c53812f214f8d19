use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid mission: {reason}")]
    InvalidMission { reason: String },

    #[error("unknown rover {0}")]
    UnknownRover(i32),

    #[error("unknown mission {0}")]
    UnknownMission(i32),

    #[error("cannot assign mission {mission_id} to rover {rover_id}: {reason}")]
    NotAssignable {
        rover_id: i32,
        mission_id: i32,
        reason: &'static str,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
