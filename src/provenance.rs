// 🏷️ Provenance Gate - Distrust matches across incompatible pipelines
// Two pipelines whose data entry conventions diverge materially (a structured
// auction feed vs a bulk manual import) produce records that agree on
// year/make/model far more often than they describe the same car. The gate
// caps those matches below the auto-merge threshold. An exact real-VIN match
// overrides provenance distrust and is never capped.

use crate::matcher::{MatchCandidate, MatchType};
use serde::{Deserialize, Serialize};

// ============================================================================
// PROVENANCE CLASS
// ============================================================================

/// Pipeline family a provenance tag belongs to, classified by tag prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvenanceClass {
    /// Structured auction feeds ("auction-feed-bat", "feed-x")
    AuctionFeed,

    /// Dealer inventory feeds ("dealer-feed-1")
    DealerFeed,

    /// Bulk manual imports ("bulk-import")
    BulkImport,

    /// Direct user uploads ("user-upload")
    UserUpload,

    /// Anything else, including vehicles created by rehydration
    Other,
}

impl ProvenanceClass {
    pub fn classify(tag: &str) -> ProvenanceClass {
        let tag = tag.trim().to_lowercase();

        if tag.starts_with("auction-feed") || tag.starts_with("feed-") {
            ProvenanceClass::AuctionFeed
        } else if tag.starts_with("dealer-feed") {
            ProvenanceClass::DealerFeed
        } else if tag.starts_with("bulk-import") || tag.starts_with("bulk_import") {
            ProvenanceClass::BulkImport
        } else if tag.starts_with("user-upload") {
            ProvenanceClass::UserUpload
        } else {
            ProvenanceClass::Other
        }
    }
}

// ============================================================================
// PROVENANCE GATE
// ============================================================================

pub struct ProvenanceGate {
    /// Known-incompatible pipeline pairs (unordered)
    pub incompatible: Vec<(ProvenanceClass, ProvenanceClass)>,

    /// Ceiling applied to capped matches
    pub confidence_cap: f64,
}

impl ProvenanceGate {
    pub fn new() -> Self {
        ProvenanceGate {
            incompatible: vec![
                (ProvenanceClass::AuctionFeed, ProvenanceClass::BulkImport),
                (ProvenanceClass::DealerFeed, ProvenanceClass::BulkImport),
            ],
            confidence_cap: 60.0,
        }
    }

    /// Check whether two provenance tags come from incompatible pipelines.
    pub fn is_incompatible(&self, tag_a: &str, tag_b: &str) -> bool {
        let class_a = ProvenanceClass::classify(tag_a);
        let class_b = ProvenanceClass::classify(tag_b);

        self.incompatible
            .iter()
            .any(|(x, y)| (*x == class_a && *y == class_b) || (*x == class_b && *y == class_a))
    }

    /// Post-process a match candidate. Confidence is only ever lowered,
    /// never raised; `vin_exact` passes through untouched.
    pub fn apply(&self, mut candidate: MatchCandidate, tag_a: &str, tag_b: &str) -> MatchCandidate {
        if candidate.match_type == MatchType::VinExact {
            return candidate;
        }

        if self.is_incompatible(tag_a, tag_b) && candidate.confidence > self.confidence_cap {
            candidate.confidence = self.confidence_cap;
            candidate.reasoning.push_str(" (capped: incompatible provenance)");
        }

        candidate
    }
}

impl Default for ProvenanceGate {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(match_type: MatchType) -> MatchCandidate {
        MatchCandidate {
            candidate_id: "candidate-1".to_string(),
            match_type,
            confidence: match_type.base_confidence(),
            reasoning: "test match".to_string(),
        }
    }

    #[test]
    fn test_classify_tags() {
        assert_eq!(ProvenanceClass::classify("auction-feed-bat"), ProvenanceClass::AuctionFeed);
        assert_eq!(ProvenanceClass::classify("feed-x"), ProvenanceClass::AuctionFeed);
        assert_eq!(ProvenanceClass::classify("dealer-feed-7"), ProvenanceClass::DealerFeed);
        assert_eq!(ProvenanceClass::classify("bulk-import"), ProvenanceClass::BulkImport);
        assert_eq!(ProvenanceClass::classify("user-upload"), ProvenanceClass::UserUpload);
        assert_eq!(ProvenanceClass::classify("rehydration"), ProvenanceClass::Other);
    }

    #[test]
    fn test_incompatible_pair_is_capped() {
        let gate = ProvenanceGate::new();

        let gated = gate.apply(candidate(MatchType::OneHasVinNull), "feed-x", "bulk-import");
        assert_eq!(gated.confidence, 60.0);
        assert!(gated.reasoning.contains("(capped: incompatible provenance)"));
    }

    #[test]
    fn test_compatible_pair_untouched() {
        let gate = ProvenanceGate::new();

        let gated = gate.apply(candidate(MatchType::OneHasVinNull), "feed-x", "feed-y");
        assert_eq!(gated.confidence, 92.0);
        assert!(!gated.reasoning.contains("capped"));
    }

    #[test]
    fn test_vin_exact_never_capped() {
        let gate = ProvenanceGate::new();

        let gated = gate.apply(candidate(MatchType::VinExact), "auction-feed-bat", "bulk-import");
        assert_eq!(gated.confidence, 100.0);
        assert!(!gated.reasoning.contains("capped"));
    }

    #[test]
    fn test_gate_never_raises_confidence() {
        let gate = ProvenanceGate::new();

        // Already below the cap: stays where it was
        let mut low = candidate(MatchType::YearMakeModel);
        low.confidence = 40.0;
        let gated = gate.apply(low, "feed-x", "bulk-import");
        assert_eq!(gated.confidence, 40.0);
    }

    #[test]
    fn test_pair_is_unordered() {
        let gate = ProvenanceGate::new();

        assert!(gate.is_incompatible("bulk-import", "auction-feed-bat"));
        assert!(gate.is_incompatible("auction-feed-bat", "bulk-import"));
        assert!(!gate.is_incompatible("user-upload", "auction-feed-bat"));
    }
}
