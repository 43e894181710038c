// 🔀 Merge Executor - Consolidate high-confidence duplicates
// Subscribes to vehicle upsert notifications, runs the matcher and the
// provenance gate, and absorbs at most one duplicate per event inside a
// single transaction. A wrong automatic merge silently destroys provenance,
// so every consolidation is recorded as a permanent audit event the
// rehydration service can later reverse.

use crate::db::{self, Event, UpsertEvent, Vehicle, EVENT_VEHICLES_MERGED};
use crate::error::EngineError;
use crate::matcher::{CandidateMatcher, MatchType};
use crate::provenance::ProvenanceGate;
use crate::vin::VinClass;
use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::cell::Cell;

// ============================================================================
// REENTRANCY GUARD
// ============================================================================

/// Scoped suppression guard passed through the merge call chain.
/// The executor's own writes (reassignment, deletion) must not re-fire
/// matching; the guard covers exactly one merge operation and nothing else -
/// unrelated merges on other connections are never serialized by it.
#[derive(Debug, Default)]
pub struct MergeGuard {
    active: Cell<bool>,
}

impl MergeGuard {
    pub fn new() -> Self {
        MergeGuard {
            active: Cell::new(false),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    fn enter(&self) -> GuardSection<'_> {
        self.active.set(true);
        GuardSection { guard: self }
    }
}

struct GuardSection<'a> {
    guard: &'a MergeGuard,
}

impl Drop for GuardSection<'_> {
    fn drop(&mut self) {
        self.guard.active.set(false);
    }
}

// ============================================================================
// MERGE OUTCOME
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub survivor_id: String,
    pub absorbed_id: String,
    pub match_type: MatchType,
    pub confidence: f64,
    /// Dependent records moved to the survivor
    pub reassigned: usize,
    /// The permanent audit event recording this consolidation
    pub event_id: String,
}

// ============================================================================
// MERGE EXECUTOR
// ============================================================================

pub struct MergeExecutor {
    /// Minimum gated confidence for an automatic merge (default: 95)
    pub auto_merge_threshold: f64,

    /// Hard cutoff on merges per upsert event (default: exactly 1).
    /// Prevents unbounded merge chains when one record matches several
    /// duplicates at once.
    pub max_merges_per_event: usize,

    pub matcher: CandidateMatcher,
    pub gate: ProvenanceGate,
}

impl MergeExecutor {
    pub fn new() -> Self {
        MergeExecutor {
            auto_merge_threshold: 95.0,
            max_merges_per_event: 1,
            matcher: CandidateMatcher::new(),
            gate: ProvenanceGate::new(),
        }
    }

    /// Subscriber entry point for vehicle upsert notifications.
    ///
    /// Runs matcher then gate, filters at the auto-merge threshold, and
    /// executes at most `max_merges_per_event` merges, each inside its own
    /// transaction. Returns the merges performed (usually zero or one).
    pub fn handle_upsert(
        &self,
        conn: &mut Connection,
        event: &UpsertEvent,
        guard: &MergeGuard,
    ) -> Result<Vec<MergeOutcome>> {
        // Re-entered from our own writes: suppress
        if guard.is_active() {
            return Ok(Vec::new());
        }
        let _section = guard.enter();

        let mut outcomes = Vec::new();

        while outcomes.len() < self.max_merges_per_event {
            match self.merge_best_candidate(conn, &event.vehicle_id)? {
                Some(outcome) => outcomes.push(outcome),
                None => break,
            }
        }

        Ok(outcomes)
    }

    /// One matcher pass and at most one merge, all inside one transaction.
    fn merge_best_candidate(
        &self,
        conn: &mut Connection,
        vehicle_id: &str,
    ) -> Result<Option<MergeOutcome>> {
        let tx = conn.transaction().context("Failed to open merge transaction")?;

        // The triggering vehicle may already have been absorbed by an
        // earlier iteration
        let vehicle = match db::get_vehicle(&tx, vehicle_id)? {
            Some(v) => v,
            None => return Ok(None),
        };

        // Input-incomplete: silently decline, not an error
        if !vehicle.identity_complete() {
            return Ok(None);
        }

        let candidates = self.matcher.find_duplicates(&tx, &vehicle)?;

        // Gate each candidate against the pair's provenance tags and take the
        // single best one above the threshold. Results arrive in deterministic
        // confidence order, and the gate only ever lowers a score below the
        // threshold, so the first qualifying candidate is the best one.
        let mut best = None;
        for candidate in candidates {
            let other = match db::get_vehicle(&tx, &candidate.candidate_id)? {
                Some(o) => o,
                None => continue,
            };

            let gated = self.gate.apply(candidate, &vehicle.provenance, &other.provenance);
            if gated.confidence >= self.auto_merge_threshold {
                best = Some((gated, other));
                break;
            }
        }

        let (candidate, other) = match best {
            Some(pair) => pair,
            None => return Ok(None),
        };

        let (survivor, absorbed) = choose_survivor(vehicle, other);
        let outcome = execute_merge(
            &tx,
            &survivor,
            &absorbed,
            candidate.match_type,
            candidate.confidence,
            "merge_executor",
        )?;

        tx.commit().context("Failed to commit merge transaction")?;
        Ok(Some(outcome))
    }

    /// Manual consolidation entry point, also used by the write-path hook's
    /// operator tooling. Permission-checked against the survivor and
    /// idempotent: if the absorbed vehicle is already gone, this is a no-op
    /// returning false.
    pub fn auto_merge(
        &self,
        conn: &mut Connection,
        survivor_id: &str,
        absorbed_id: &str,
        match_type: MatchType,
        confidence: f64,
        actor_id: &str,
    ) -> Result<bool> {
        let survivor = db::get_vehicle(conn, survivor_id)?
            .ok_or_else(|| EngineError::VehicleNotFound(survivor_id.to_string()))?;

        if !db::has_access(conn, survivor_id, actor_id)? {
            return Err(EngineError::PermissionDenied {
                actor_id: actor_id.to_string(),
                vehicle_id: survivor_id.to_string(),
            }
            .into());
        }

        let tx = conn.transaction().context("Failed to open merge transaction")?;

        let absorbed = match db::get_vehicle(&tx, absorbed_id)? {
            Some(v) => v,
            // Already merged - idempotent no-op
            None => return Ok(false),
        };

        execute_merge(&tx, &survivor, &absorbed, match_type, confidence, actor_id)?;
        tx.commit().context("Failed to commit merge transaction")?;

        Ok(true)
    }
}

impl Default for MergeExecutor {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// SURVIVOR SELECTION
// ============================================================================

/// VIN-quality heuristic: the side holding a real (non-placeholder,
/// non-blank) identifier survives. When both or neither qualify, the
/// earliest-created vehicle survives; exact ties fall back to the lowest id.
pub fn choose_survivor(a: Vehicle, b: Vehicle) -> (Vehicle, Vehicle) {
    let a_real = VinClass::of(a.vin_str()) == VinClass::Real;
    let b_real = VinClass::of(b.vin_str()) == VinClass::Real;

    match (a_real, b_real) {
        (true, false) => (a, b),
        (false, true) => (b, a),
        _ => {
            if (a.created_at, &a.id) <= (b.created_at, &b.id) {
                (a, b)
            } else {
                (b, a)
            }
        }
    }
}

// ============================================================================
// MERGE EXECUTION (shared by automatic and manual paths)
// ============================================================================

/// Reassign dependents, record the audit event, retire the absorbed vehicle.
/// Caller owns the transaction; any failure here aborts the whole thing.
fn execute_merge(
    conn: &Connection,
    survivor: &Vehicle,
    absorbed: &Vehicle,
    match_type: MatchType,
    confidence: f64,
    actor: &str,
) -> Result<MergeOutcome> {
    let reassigned = db::reassign_dependents(conn, &absorbed.id, &survivor.id)?;

    let event = Event::new(
        EVENT_VEHICLES_MERGED,
        "vehicle",
        &survivor.id,
        serde_json::json!({
            "duplicate_vehicle_id": absorbed.id,
            "duplicate_vin": absorbed.vin,
            "duplicate_provenance": absorbed.provenance,
            "match_type": match_type.as_str(),
            "confidence": confidence,
            "reassigned": reassigned,
        }),
        actor,
    );
    db::insert_event(conn, &event)?;

    db::delete_vehicle(conn, &absorbed.id)?;

    Ok(MergeOutcome {
        survivor_id: survivor.id.clone(),
        absorbed_id: absorbed.id.clone(),
        match_type,
        confidence,
        reassigned,
        event_id: event.event_id,
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
        get_dependents, get_events_for_entity, get_vehicle, insert_dependent, insert_vehicle,
        DependentRecord, RecordKind,
    };
    use chrono::Duration;

    fn upsert_event_for(vehicle: &Vehicle) -> UpsertEvent {
        UpsertEvent {
            vehicle_id: vehicle.id.clone(),
            changed_fields: vec!["vin".to_string()],
        }
    }

    #[test]
    fn test_auto_merge_at_threshold() {
        let mut conn = test_conn();

        // Real VIN vs placeholder: confidence 95, at the threshold
        let real = create_test_vehicle(1972, "Ford", "Bronco", Some("U15GLK12345"), "user-upload");
        let dup = create_test_vehicle(1972, "Ford", "Bronco", Some("NOVIN000413"), "user-upload");
        insert_vehicle(&conn, &real).unwrap();
        insert_vehicle(&conn, &dup).unwrap();

        insert_dependent(&conn, &DependentRecord::new(&dup.id, RecordKind::Image, "img-7.jpg"))
            .unwrap();

        let executor = MergeExecutor::new();
        let guard = MergeGuard::new();
        let outcomes = executor
            .handle_upsert(&mut conn, &upsert_event_for(&dup), &guard)
            .unwrap();

        assert_eq!(outcomes.len(), 1);
        let outcome = &outcomes[0];
        assert_eq!(outcome.survivor_id, real.id); // real VIN survives
        assert_eq!(outcome.absorbed_id, dup.id);
        assert_eq!(outcome.match_type, MatchType::OneHasVinPlaceholder);
        assert_eq!(outcome.reassigned, 1);

        // Absorbed vehicle gone, dependents moved, audit event written
        assert!(get_vehicle(&conn, &dup.id).unwrap().is_none());
        assert_eq!(get_dependents(&conn, &real.id).unwrap().len(), 1);
        let events = get_events_for_entity(&conn, "vehicle", &real.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EVENT_VEHICLES_MERGED);
    }

    #[test]
    fn test_below_threshold_no_merge() {
        let mut conn = test_conn();

        // Real VIN vs absent: confidence 92, below the 95 threshold
        let a = create_test_vehicle(1972, "Ford", "Bronco", Some("U15GLK12345"), "user-upload");
        let b = create_test_vehicle(1972, "Ford", "Bronco", None, "user-upload");
        insert_vehicle(&conn, &a).unwrap();
        insert_vehicle(&conn, &b).unwrap();

        let outcomes = MergeExecutor::new()
            .handle_upsert(&mut conn, &upsert_event_for(&a), &MergeGuard::new())
            .unwrap();

        assert!(outcomes.is_empty());
        assert!(get_vehicle(&conn, &b.id).unwrap().is_some());
    }

    #[test]
    fn test_provenance_cap_blocks_auto_merge() {
        let mut conn = test_conn();

        // Would be 95, but the pipelines are incompatible: capped to 60
        let a = create_test_vehicle(1972, "Ford", "Bronco", Some("U15GLK12345"), "auction-feed-bat");
        let b = create_test_vehicle(1972, "Ford", "Bronco", Some("NOVIN000413"), "bulk-import");
        insert_vehicle(&conn, &a).unwrap();
        insert_vehicle(&conn, &b).unwrap();

        let outcomes = MergeExecutor::new()
            .handle_upsert(&mut conn, &upsert_event_for(&a), &MergeGuard::new())
            .unwrap();

        assert!(outcomes.is_empty());
    }

    #[test]
    fn test_vin_exact_merges_across_incompatible_provenance() {
        let mut conn = test_conn();

        let a = create_test_vehicle(1972, "Ford", "Bronco", Some("U15GLK12345"), "auction-feed-bat");
        let b = create_test_vehicle(1972, "Ford", "Bronco", Some("U15GLK12345"), "bulk-import");
        insert_vehicle(&conn, &a).unwrap();
        insert_vehicle(&conn, &b).unwrap();

        let outcomes = MergeExecutor::new()
            .handle_upsert(&mut conn, &upsert_event_for(&a), &MergeGuard::new())
            .unwrap();

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].match_type, MatchType::VinExact);
    }

    #[test]
    fn test_single_merge_per_event() {
        let mut conn = test_conn();

        // One real-VIN vehicle matching three placeholder duplicates
        let real = create_test_vehicle(1972, "Ford", "Bronco", Some("U15GLK12345"), "user-upload");
        insert_vehicle(&conn, &real).unwrap();

        let mut dup_ids = Vec::new();
        for i in 0..3 {
            let dup = create_test_vehicle(
                1972,
                "Ford",
                "Bronco",
                Some(&format!("NOVIN00{}", i)),
                "user-upload",
            );
            insert_vehicle(&conn, &dup).unwrap();
            dup_ids.push(dup.id);
        }

        let outcomes = MergeExecutor::new()
            .handle_upsert(&mut conn, &upsert_event_for(&real), &MergeGuard::new())
            .unwrap();

        // Exactly one merge; the other two duplicates stay for later events
        assert_eq!(outcomes.len(), 1);
        let remaining: usize = dup_ids
            .iter()
            .filter(|id| get_vehicle(&conn, id).unwrap().is_some())
            .count();
        assert_eq!(remaining, 2);
    }

    #[test]
    fn test_guard_suppresses_reentry() {
        let mut conn = test_conn();

        let real = create_test_vehicle(1972, "Ford", "Bronco", Some("U15GLK12345"), "user-upload");
        let dup = create_test_vehicle(1972, "Ford", "Bronco", Some("NOVIN000413"), "user-upload");
        insert_vehicle(&conn, &real).unwrap();
        insert_vehicle(&conn, &dup).unwrap();

        let guard = MergeGuard::new();
        guard.active.set(true); // a merge is already executing on this chain

        let outcomes = MergeExecutor::new()
            .handle_upsert(&mut conn, &upsert_event_for(&dup), &guard)
            .unwrap();

        assert!(outcomes.is_empty());
        assert!(get_vehicle(&conn, &dup.id).unwrap().is_some());

        // Guard released after the suppressed call: next event merges
        guard.active.set(false);
        let outcomes = MergeExecutor::new()
            .handle_upsert(&mut conn, &upsert_event_for(&dup), &guard)
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(!guard.is_active());
    }

    #[test]
    fn test_survivor_tie_break_earliest_created() {
        let mut conn = test_conn();

        // Both sides hold the same real VIN: earliest created_at survives
        let mut older = create_test_vehicle(1972, "Ford", "Bronco", Some("U15GLK12345"), "feed-x");
        older.created_at = older.created_at - Duration::days(30);
        let newer = create_test_vehicle(1972, "Ford", "Bronco", Some("U15GLK12345"), "feed-y");
        insert_vehicle(&conn, &older).unwrap();
        insert_vehicle(&conn, &newer).unwrap();

        let outcomes = MergeExecutor::new()
            .handle_upsert(&mut conn, &upsert_event_for(&newer), &MergeGuard::new())
            .unwrap();

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].survivor_id, older.id);
        assert_eq!(outcomes[0].absorbed_id, newer.id);
    }

    #[test]
    fn test_manual_auto_merge_idempotent() {
        let mut conn = test_conn();

        let survivor = create_test_vehicle(1972, "Ford", "Bronco", Some("U15GLK12345"), "feed-x");
        let absorbed = create_test_vehicle(1972, "Ford", "Bronco", None, "feed-x");
        insert_vehicle(&conn, &survivor).unwrap();
        insert_vehicle(&conn, &absorbed).unwrap();

        let executor = MergeExecutor::new();
        let merged = executor
            .auto_merge(&mut conn, &survivor.id, &absorbed.id, MatchType::OneHasVinNull, 92.0, "user-1")
            .unwrap();
        assert!(merged);

        // Identical second call: absorbed vehicle no longer exists
        let merged = executor
            .auto_merge(&mut conn, &survivor.id, &absorbed.id, MatchType::OneHasVinNull, 92.0, "user-1")
            .unwrap();
        assert!(!merged);
    }

    #[test]
    fn test_manual_auto_merge_requires_access() {
        let mut conn = test_conn();

        let survivor = create_test_vehicle(1972, "Ford", "Bronco", Some("U15GLK12345"), "feed-x");
        let absorbed = create_test_vehicle(1972, "Ford", "Bronco", None, "feed-x");
        insert_vehicle(&conn, &survivor).unwrap();
        insert_vehicle(&conn, &absorbed).unwrap();

        let err = MergeExecutor::new()
            .auto_merge(&mut conn, &survivor.id, &absorbed.id, MatchType::OneHasVinNull, 92.0, "intruder")
            .unwrap_err();

        assert!(err.to_string().contains("does not have access"));
        assert!(get_vehicle(&conn, &absorbed.id).unwrap().is_some());
    }

    #[test]
    fn test_incomplete_identity_never_triggers() {
        let mut conn = test_conn();

        let mut partial = create_test_vehicle(1972, "Ford", "Bronco", None, "user-upload");
        partial.make = None;
        let other = create_test_vehicle(1972, "Ford", "Bronco", None, "user-upload");
        insert_vehicle(&conn, &partial).unwrap();
        insert_vehicle(&conn, &other).unwrap();

        let outcomes = MergeExecutor::new()
            .handle_upsert(&mut conn, &upsert_event_for(&partial), &MergeGuard::new())
            .unwrap();

        assert!(outcomes.is_empty());
    }
}
