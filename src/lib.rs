// Vehicle Identity Resolution Engine - Core Library
// Exposes all modules for use in the CLI, API server, and tests

pub mod db;
pub mod error;
pub mod vin;
pub mod matcher;
pub mod provenance;
pub mod merge;
pub mod rehydrate;

// Re-export commonly used types
pub use db::{
    Vehicle, DependentRecord, RecordKind, Event, UpsertEvent,
    setup_database, insert_vehicle, upsert_vehicle, get_vehicle, delete_vehicle,
    get_vehicles_by_year, count_vehicles, has_access,
    insert_dependent, get_dependents, reassign_dependents,
    insert_event, get_event, get_events_for_entity,
    load_vehicles_csv, import_vehicles,
    EVENT_VEHICLE_ADDED, EVENT_VEHICLES_MERGED, EVENT_VEHICLE_REHYDRATED,
};
pub use error::EngineError;
pub use vin::{
    validate_vin, is_placeholder_vin, VinValidation, VinMethod, VinClass,
    PLACEHOLDER_PREFIXES,
};
pub use matcher::{CandidateMatcher, MatchCandidate, MatchType};
pub use provenance::{ProvenanceGate, ProvenanceClass};
pub use merge::{MergeExecutor, MergeGuard, MergeOutcome};
pub use rehydrate::{
    plan_rehydration, execute_rehydration,
    RehydrationPlan, RehydrationResult, PlannedMove, REHYDRATION_PROVENANCE,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
