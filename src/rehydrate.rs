// 💧 Rehydration Service - Reverse an incorrect consolidation
// Reads the merge audit event the executor wrote, reconstructs a separate
// vehicle, and moves back only dependent records that are provably foreign.
// Conservative by design: under-moving is preferred to over-moving, so a
// record stays on the survivor unless one of the heuristics clears it.

use crate::db::{
    self, Event, Vehicle, EVENT_VEHICLES_MERGED, EVENT_VEHICLE_REHYDRATED, RecordKind,
};
use crate::error::EngineError;
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Provenance tag for vehicles reconstructed by this service. They were
/// produced by the engine, not by any ingestion pipeline.
pub const REHYDRATION_PROVENANCE: &str = "rehydration";

// ============================================================================
// PLAN
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedMove {
    pub record_id: String,
    pub kind: RecordKind,
    /// Which heuristic cleared this record as provably foreign
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RehydrationPlan {
    pub survivor_id: String,
    pub merge_event_id: String,
    pub absorbed_vehicle_id: String,
    pub moves: Vec<PlannedMove>,
}

impl RehydrationPlan {
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// Moves grouped per dependent-record category.
    pub fn by_kind(&self) -> HashMap<RecordKind, usize> {
        let mut counts = HashMap::new();
        for planned in &self.moves {
            *counts.entry(planned.kind).or_insert(0) += 1;
        }
        counts
    }

    pub fn summary(&self) -> String {
        format!(
            "Rehydration plan for {}: {} record(s) would move back from merge event {}",
            self.survivor_id,
            self.moves.len(),
            self.merge_event_id,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RehydrationResult {
    pub new_vehicle_id: String,
    pub moved: usize,
    pub plan: RehydrationPlan,
}

// ============================================================================
// VALIDATION (all rejections happen before any computation)
// ============================================================================

fn validate_request(
    conn: &Connection,
    survivor_id: &str,
    merge_event_id: &str,
    actor_id: &str,
) -> Result<(Vehicle, Event)> {
    let survivor = db::get_vehicle(conn, survivor_id)?
        .ok_or_else(|| EngineError::VehicleNotFound(survivor_id.to_string()))?;

    if !db::has_access(conn, survivor_id, actor_id)? {
        return Err(EngineError::PermissionDenied {
            actor_id: actor_id.to_string(),
            vehicle_id: survivor_id.to_string(),
        }
        .into());
    }

    let event = db::get_event(conn, merge_event_id)?
        .ok_or_else(|| EngineError::MergeEventNotFound(merge_event_id.to_string()))?;

    if event.event_type != EVENT_VEHICLES_MERGED || event.entity_id != survivor_id {
        return Err(EngineError::MergeEventMismatch {
            event_id: merge_event_id.to_string(),
            vehicle_id: survivor_id.to_string(),
        }
        .into());
    }

    Ok((survivor, event))
}

// ============================================================================
// PLANNING (dry run - pure read)
// ============================================================================

/// Compute which dependent records would move back, per the provably-foreign
/// heuristic:
/// - created before the survivor itself existed, or
/// - still textually references the absorbed vehicle's id (stored URLs)
/// Records failing both tests stay on the survivor even if they might belong
/// to the absorbed vehicle.
fn compute_plan(conn: &Connection, survivor: &Vehicle, event: &Event) -> Result<RehydrationPlan> {
    let absorbed_id = event
        .data
        .get("duplicate_vehicle_id")
        .and_then(|v| v.as_str())
        .context("merge event is missing duplicate_vehicle_id")?
        .to_string();

    let mut moves = Vec::new();
    for record in db::get_dependents(conn, &survivor.id)? {
        let reason = if record.created_at < survivor.created_at {
            Some("created before the survivor existed".to_string())
        } else if record.body.contains(&absorbed_id) {
            Some("still references the absorbed vehicle".to_string())
        } else {
            None
        };

        if let Some(reason) = reason {
            moves.push(PlannedMove {
                record_id: record.id,
                kind: record.kind,
                reason,
            });
        }
    }

    Ok(RehydrationPlan {
        survivor_id: survivor.id.clone(),
        merge_event_id: event.event_id.clone(),
        absorbed_vehicle_id: absorbed_id,
        moves,
    })
}

/// Dry run: what would move, and why. Never mutates the store.
pub fn plan_rehydration(
    conn: &Connection,
    survivor_id: &str,
    merge_event_id: &str,
    actor_id: &str,
) -> Result<RehydrationPlan> {
    let (survivor, event) = validate_request(conn, survivor_id, merge_event_id, actor_id)?;
    compute_plan(conn, &survivor, &event)
}

// ============================================================================
// EXECUTION
// ============================================================================

/// Execute the reversal: create a new vehicle carrying the survivor's
/// identity fields (VIN intentionally blank - the absorbed identifier is not
/// reliably known), move the planned records to it, and note the rehydration
/// on both vehicles. All-or-nothing.
pub fn execute_rehydration(
    conn: &mut Connection,
    survivor_id: &str,
    merge_event_id: &str,
    actor_id: &str,
) -> Result<RehydrationResult> {
    let tx = conn
        .transaction()
        .context("Failed to open rehydration transaction")?;

    let (survivor, event) = validate_request(&tx, survivor_id, merge_event_id, actor_id)?;
    let plan = compute_plan(&tx, &survivor, &event)?;

    let mut metadata = HashMap::new();
    metadata.insert(
        "rehydrated_from".to_string(),
        serde_json::json!(survivor.id),
    );
    metadata.insert(
        "merge_event_id".to_string(),
        serde_json::json!(event.event_id),
    );

    let new_vehicle = Vehicle {
        id: uuid::Uuid::new_v4().to_string(),
        year: survivor.year,
        make: survivor.make.clone(),
        model: survivor.model.clone(),
        vin: None,
        provenance: REHYDRATION_PROVENANCE.to_string(),
        owner_id: survivor.owner_id.clone(),
        metadata,
        created_at: Utc::now(),
    };
    db::insert_vehicle_no_dedup(&tx, &new_vehicle)?;

    let record_ids: Vec<String> = plan.moves.iter().map(|m| m.record_id.clone()).collect();
    let moved = db::reassign_dependents_by_id(&tx, &record_ids, &new_vehicle.id)?;

    // Audit note on both sides of the reversal
    db::insert_event(
        &tx,
        &Event::new(
            EVENT_VEHICLE_REHYDRATED,
            "vehicle",
            &survivor.id,
            serde_json::json!({
                "merge_event_id": event.event_id,
                "new_vehicle_id": new_vehicle.id,
                "absorbed_vehicle_id": plan.absorbed_vehicle_id,
                "moved": moved,
            }),
            actor_id,
        ),
    )?;
    db::insert_event(
        &tx,
        &Event::new(
            EVENT_VEHICLE_REHYDRATED,
            "vehicle",
            &new_vehicle.id,
            serde_json::json!({
                "merge_event_id": event.event_id,
                "rehydrated_from": survivor.id,
                "moved": moved,
            }),
            actor_id,
        ),
    )?;

    tx.commit().context("Failed to commit rehydration")?;

    Ok(RehydrationResult {
        new_vehicle_id: new_vehicle.id,
        moved,
        plan,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{create_test_vehicle, test_conn};
    use crate::db::{
        count_vehicles, get_dependents, get_events_for_entity, insert_dependent, insert_vehicle,
        DependentRecord,
    };
    use crate::matcher::MatchType;
    use crate::merge::MergeExecutor;
    use chrono::Duration;

    /// Merge an older absorbed vehicle into a survivor, with three dependents
    /// landing on the survivor: one predating it, one referencing the
    /// absorbed id, one that is provably nothing.
    fn merged_fixture(conn: &mut Connection) -> (Vehicle, String, String) {
        let survivor =
            create_test_vehicle(1972, "Ford", "Bronco", Some("U15GLK12345"), "user-upload");
        let mut absorbed = create_test_vehicle(1972, "Ford", "Bronco", None, "bulk-import");
        absorbed.created_at = survivor.created_at - Duration::days(90);
        insert_vehicle(conn, &survivor).unwrap();
        insert_vehicle(conn, &absorbed).unwrap();

        // Belonged to the absorbed vehicle before the merge
        let mut old_image = DependentRecord::new(
            &absorbed.id,
            RecordKind::Image,
            &format!("https://img.example/vehicles/{}/front.jpg", absorbed.id),
        );
        old_image.created_at = survivor.created_at - Duration::days(60);
        insert_dependent(conn, &old_image).unwrap();

        // Created after the merge but still pointing at the absorbed id
        let stale_doc = DependentRecord::new(
            &absorbed.id,
            RecordKind::Document,
            &format!("https://docs.example/vehicles/{}/title.pdf", absorbed.id),
        );
        insert_dependent(conn, &stale_doc).unwrap();

        // Genuinely the survivor's own record
        insert_dependent(
            conn,
            &DependentRecord::new(&survivor.id, RecordKind::TimelineEvent, "sold at auction"),
        )
        .unwrap();

        let merged = MergeExecutor::new()
            .auto_merge(
                conn,
                &survivor.id,
                &absorbed.id,
                MatchType::OneHasVinNull,
                92.0,
                "user-1",
            )
            .unwrap();
        assert!(merged);

        let merge_event = get_events_for_entity(conn, "vehicle", &survivor.id)
            .unwrap()
            .into_iter()
            .find(|e| e.event_type == EVENT_VEHICLES_MERGED)
            .unwrap();

        (survivor, absorbed.id.clone(), merge_event.event_id)
    }

    #[test]
    fn test_plan_identifies_provably_foreign_records() {
        let mut conn = test_conn();
        let (survivor, absorbed_id, event_id) = merged_fixture(&mut conn);

        let plan = plan_rehydration(&conn, &survivor.id, &event_id, "user-1").unwrap();

        assert_eq!(plan.absorbed_vehicle_id, absorbed_id);
        assert_eq!(plan.moves.len(), 2);
        assert!(plan
            .moves
            .iter()
            .any(|m| m.reason.contains("created before the survivor")));
        assert!(plan
            .moves
            .iter()
            .any(|m| m.reason.contains("references the absorbed vehicle")));

        let by_kind = plan.by_kind();
        assert_eq!(by_kind.get(&RecordKind::Image), Some(&1));
        assert_eq!(by_kind.get(&RecordKind::Document), Some(&1));
        assert_eq!(by_kind.get(&RecordKind::TimelineEvent), None);
    }

    #[test]
    fn test_dry_run_is_pure_and_deterministic() {
        let mut conn = test_conn();
        let (survivor, _, event_id) = merged_fixture(&mut conn);

        let vehicles_before = count_vehicles(&conn).unwrap();
        let dependents_before = get_dependents(&conn, &survivor.id).unwrap().len();

        let first = plan_rehydration(&conn, &survivor.id, &event_id, "user-1").unwrap();
        let second = plan_rehydration(&conn, &survivor.id, &event_id, "user-1").unwrap();

        // Identical plans, nothing mutated
        assert_eq!(first, second);
        assert_eq!(count_vehicles(&conn).unwrap(), vehicles_before);
        assert_eq!(
            get_dependents(&conn, &survivor.id).unwrap().len(),
            dependents_before
        );
    }

    #[test]
    fn test_execute_moves_records_to_new_vehicle() {
        let mut conn = test_conn();
        let (survivor, _, event_id) = merged_fixture(&mut conn);

        let result = execute_rehydration(&mut conn, &survivor.id, &event_id, "user-1").unwrap();
        assert_eq!(result.moved, 2);

        // New vehicle: survivor identity, blank VIN, engine provenance
        let new_vehicle = db::get_vehicle(&conn, &result.new_vehicle_id)
            .unwrap()
            .unwrap();
        assert_eq!(new_vehicle.year, survivor.year);
        assert_eq!(new_vehicle.make, survivor.make);
        assert!(new_vehicle.vin.is_none());
        assert_eq!(new_vehicle.provenance, REHYDRATION_PROVENANCE);
        assert_eq!(new_vehicle.owner_id, survivor.owner_id);

        // Only the provably-foreign records moved
        assert_eq!(get_dependents(&conn, &result.new_vehicle_id).unwrap().len(), 2);
        let remaining = get_dependents(&conn, &survivor.id).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].kind, RecordKind::TimelineEvent);

        // Audit notes on both vehicles
        let survivor_events = get_events_for_entity(&conn, "vehicle", &survivor.id).unwrap();
        assert!(survivor_events
            .iter()
            .any(|e| e.event_type == EVENT_VEHICLE_REHYDRATED));
        let new_events =
            get_events_for_entity(&conn, "vehicle", &result.new_vehicle_id).unwrap();
        assert_eq!(new_events.len(), 1);
        assert_eq!(new_events[0].event_type, EVENT_VEHICLE_REHYDRATED);

        // The merge audit event is still there - it is never deleted
        assert!(survivor_events
            .iter()
            .any(|e| e.event_type == EVENT_VEHICLES_MERGED));
    }

    #[test]
    fn test_rejects_unknown_survivor() {
        let mut conn = test_conn();
        let (_, _, event_id) = merged_fixture(&mut conn);

        let err = plan_rehydration(&conn, "missing", &event_id, "user-1").unwrap_err();
        assert!(err.to_string().contains("vehicle not found"));
    }

    #[test]
    fn test_rejects_unauthorized_actor() {
        let mut conn = test_conn();
        let (survivor, _, event_id) = merged_fixture(&mut conn);

        let err = plan_rehydration(&conn, &survivor.id, &event_id, "intruder").unwrap_err();
        assert!(err.to_string().contains("does not have access"));
    }

    #[test]
    fn test_rejects_missing_merge_event() {
        let mut conn = test_conn();
        let (survivor, _, _) = merged_fixture(&mut conn);

        let err = plan_rehydration(&conn, &survivor.id, "no-such-event", "user-1").unwrap_err();
        assert!(err.to_string().contains("merge event not found"));
    }

    #[test]
    fn test_rejects_event_of_another_vehicle() {
        let mut conn = test_conn();
        let (survivor, _, event_id) = merged_fixture(&mut conn);

        // A second, unrelated vehicle owned by the same user
        let other = create_test_vehicle(1965, "Shelby", "Cobra", Some("CSX3015"), "user-upload");
        insert_vehicle(&conn, &other).unwrap();

        let err = plan_rehydration(&conn, &other.id, &event_id, "user-1").unwrap_err();
        assert!(err.to_string().contains("does not belong to vehicle"));

        // Rejected before any computation: nothing changed
        assert!(get_dependents(&conn, &other.id).unwrap().is_empty());
        let _ = survivor;
    }

    #[test]
    fn test_rejects_non_merge_event() {
        let mut conn = test_conn();
        let (survivor, _, _) = merged_fixture(&mut conn);

        // An event on the survivor that is not a merge record
        let note = Event::new(
            "vehicle_added",
            "vehicle",
            &survivor.id,
            serde_json::json!({}),
            "csv_importer",
        );
        db::insert_event(&conn, &note).unwrap();

        let err = plan_rehydration(&conn, &survivor.id, &note.event_id, "user-1").unwrap_err();
        assert!(err.to_string().contains("does not belong to vehicle"));
    }
}
