// 🔍 Candidate Matcher - Find vehicles that describe the same physical car
// Year must match exactly; make/model match loosely; the identifier
// relationship decides match type and confidence via a priority ladder.
// This component performs no writes.

use crate::db::{self, Vehicle};
use crate::error::EngineError;
use crate::vin::VinClass;
use anyhow::Result;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

// ============================================================================
// MATCH TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    /// Both sides hold a real identifier and they are equal
    VinExact,

    /// One side has a real identifier, the other a placeholder
    OneHasVinPlaceholder,

    /// One side has a real identifier, the other none at all
    OneHasVinNull,

    /// Both sides carry the same placeholder value
    SamePlaceholderVin,

    /// Neither side has an identifier
    NoVin,

    /// Year/make/model agree but the identifiers don't fit any rule above
    YearMakeModel,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::VinExact => "vin_exact",
            MatchType::OneHasVinPlaceholder => "one_has_vin_placeholder",
            MatchType::OneHasVinNull => "one_has_vin_null",
            MatchType::SamePlaceholderVin => "same_placeholder_vin",
            MatchType::NoVin => "no_vin",
            MatchType::YearMakeModel => "year_make_model",
        }
    }

    pub fn parse(s: &str) -> Option<MatchType> {
        match s {
            "vin_exact" => Some(MatchType::VinExact),
            "one_has_vin_placeholder" => Some(MatchType::OneHasVinPlaceholder),
            "one_has_vin_null" => Some(MatchType::OneHasVinNull),
            "same_placeholder_vin" => Some(MatchType::SamePlaceholderVin),
            "no_vin" => Some(MatchType::NoVin),
            "year_make_model" => Some(MatchType::YearMakeModel),
            _ => None,
        }
    }

    /// Base confidence for this match type (0-100 scale).
    pub fn base_confidence(&self) -> f64 {
        match self {
            MatchType::VinExact => 100.0,
            MatchType::OneHasVinPlaceholder => 95.0,
            MatchType::OneHasVinNull => 92.0,
            MatchType::SamePlaceholderVin => 90.0,
            MatchType::NoVin => 88.0,
            MatchType::YearMakeModel => 85.0,
        }
    }
}

// ============================================================================
// MATCH CANDIDATE (transient - computed on demand, never persisted)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub candidate_id: String,
    pub match_type: MatchType,
    /// Confidence score (0-100)
    pub confidence: f64,
    /// Human-readable reason naming the rule that fired
    pub reasoning: String,
}

// ============================================================================
// CANDIDATE MATCHER
// ============================================================================

pub struct CandidateMatcher {
    /// Allow bidirectional substring matching on make/model
    /// ("Bronco" matches "Bronco Sport"). Intentionally permissive and a
    /// known source of false positives; disable for exact-only matching.
    pub substring_make_model: bool,
}

impl CandidateMatcher {
    pub fn new() -> Self {
        CandidateMatcher {
            substring_make_model: true,
        }
    }

    pub fn exact_only() -> Self {
        CandidateMatcher {
            substring_make_model: false,
        }
    }

    /// Find duplicate candidates for a vehicle already loaded from the store.
    /// Silently declines (empty result) when year/make/model are incomplete -
    /// that is a no-op, not an error.
    pub fn find_duplicates(&self, conn: &Connection, vehicle: &Vehicle) -> Result<Vec<MatchCandidate>> {
        if !vehicle.identity_complete() {
            return Ok(Vec::new());
        }

        let year = match vehicle.year {
            Some(y) => y,
            None => return Ok(Vec::new()),
        };
        let make = vehicle.make.as_deref().unwrap_or_default();
        let model = vehicle.model.as_deref().unwrap_or_default();

        let mut scored: Vec<(MatchCandidate, chrono::DateTime<chrono::Utc>, String)> = Vec::new();

        for other in db::get_vehicles_by_year(conn, year, &vehicle.id)? {
            let other_make = other.make.as_deref().unwrap_or_default();
            let other_model = other.model.as_deref().unwrap_or_default();

            if !self.text_matches(make, other_make) || !self.text_matches(model, other_model) {
                continue;
            }

            let candidate = self.classify_pair(vehicle, &other);
            scored.push((candidate, other.created_at, other.id.clone()));
        }

        // Deterministic order: confidence desc, then candidate age, then id
        scored.sort_by(|a, b| {
            b.0.confidence
                .partial_cmp(&a.0.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });

        Ok(scored.into_iter().map(|(c, _, _)| c).collect())
    }

    /// FindDuplicates by id - the read-only surface review tooling calls.
    pub fn find_duplicates_by_id(
        &self,
        conn: &Connection,
        vehicle_id: &str,
    ) -> Result<Vec<MatchCandidate>> {
        let vehicle = db::get_vehicle(conn, vehicle_id)?
            .ok_or_else(|| EngineError::VehicleNotFound(vehicle_id.to_string()))?;

        self.find_duplicates(conn, &vehicle)
    }

    /// Make/model comparison: exact (case-insensitive, trimmed) or, when
    /// enabled, bidirectional containment.
    fn text_matches(&self, a: &str, b: &str) -> bool {
        let a = a.trim().to_lowercase();
        let b = b.trim().to_lowercase();

        if a.is_empty() || b.is_empty() {
            return false;
        }

        if a == b {
            return true;
        }

        self.substring_make_model && (a.contains(&b) || b.contains(&a))
    }

    /// Identifier priority ladder - the first rule that applies wins.
    fn classify_pair(&self, vehicle: &Vehicle, other: &Vehicle) -> MatchCandidate {
        let vin_a = vehicle.vin_str();
        let vin_b = other.vin_str();
        let class_a = VinClass::of(vin_a);
        let class_b = VinClass::of(vin_b);

        let (match_type, reasoning) = match (class_a, class_b) {
            // Rule 1: both real and equal
            (VinClass::Real, VinClass::Real)
                if vins_equal(vin_a, vin_b) =>
            {
                (
                    MatchType::VinExact,
                    format!("Exact VIN match: {}", vin_a.unwrap_or_default()),
                )
            }

            // Rule 2: exactly one real, other placeholder
            (VinClass::Real, VinClass::Placeholder) | (VinClass::Placeholder, VinClass::Real) => (
                MatchType::OneHasVinPlaceholder,
                format!(
                    "One side has a real VIN, the other a placeholder ({} vs {})",
                    vin_a.unwrap_or("-"),
                    vin_b.unwrap_or("-"),
                ),
            ),

            // Rule 3: exactly one real, other absent
            (VinClass::Real, VinClass::Absent) | (VinClass::Absent, VinClass::Real) => (
                MatchType::OneHasVinNull,
                format!(
                    "One side has a real VIN, the other none ({})",
                    vin_a.or(vin_b).unwrap_or_default(),
                ),
            ),

            // Rule 4: both carry the same placeholder value
            (VinClass::Placeholder, VinClass::Placeholder)
                if vins_equal(vin_a, vin_b) =>
            {
                (
                    MatchType::SamePlaceholderVin,
                    format!("Same placeholder VIN: {}", vin_a.unwrap_or_default()),
                )
            }

            // Rule 5: neither side has an identifier
            (VinClass::Absent, VinClass::Absent) => (
                MatchType::NoVin,
                format!("Neither side has a VIN: {}", other.label()),
            ),

            // Rule 6: year/make/model agree but identifiers don't line up
            _ => (
                MatchType::YearMakeModel,
                format!("Year/make/model match: {}", other.label()),
            ),
        };

        MatchCandidate {
            candidate_id: other.id.clone(),
            match_type,
            confidence: match_type.base_confidence(),
            reasoning,
        }
    }
}

impl Default for CandidateMatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn vins_equal(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.trim().eq_ignore_ascii_case(b.trim()),
        _ => false,
    }
}

// ============================================================================
// TESTS
// ============================================================================
