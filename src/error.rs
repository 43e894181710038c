// Typed rejections callers branch on (permission vs referential).
// Everything else flows through anyhow with context.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("vehicle not found: {0}")]
    VehicleNotFound(String),

    #[error("actor {actor_id} does not have access to vehicle {vehicle_id}")]
    PermissionDenied { actor_id: String, vehicle_id: String },

    #[error("merge event not found: {0}")]
    MergeEventNotFound(String),

    #[error("merge event {event_id} does not belong to vehicle {vehicle_id}")]
    MergeEventMismatch { event_id: String, vehicle_id: String },
}
