// 🔢 VIN Validator - Classify identifier strings
// Pure function: same input always produces the same structured result.
// Matching depends on this being deterministic and side-effect free.

use serde::{Deserialize, Serialize};

// ============================================================================
// PLACEHOLDER PATTERNS
// ============================================================================

/// Known prefixes of system-generated stand-in identifiers.
/// A VIN-shaped string starting with one of these was minted by an ingestion
/// pipeline, not by a manufacturer.
pub const PLACEHOLDER_PREFIXES: &[&str] = &["NOVIN", "NO-VIN", "PENDING", "TBD"];

/// Check if an identifier is a known placeholder (case-insensitive prefix).
pub fn is_placeholder_vin(vin: &str) -> bool {
    let upper = vin.trim().to_uppercase();
    PLACEHOLDER_PREFIXES
        .iter()
        .any(|prefix| upper.starts_with(prefix))
}

// ============================================================================
// VALIDATION METHOD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VinMethod {
    /// Empty or whitespace-only input
    Blank,

    /// Matched a known placeholder prefix
    PatternCheck,

    /// Contains characters outside the VIN alphabet (I, O, Q excluded)
    CharacterCheck,

    /// Length outside {17} and [4, 16]
    LengthCheck,

    /// Length 4-16: pre-1981 identifier, no checksum existed
    LegacyLength,

    /// Length 17: ISO 3779 weighted check digit
    CheckDigit,
}

impl VinMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            VinMethod::Blank => "blank",
            VinMethod::PatternCheck => "pattern_check",
            VinMethod::CharacterCheck => "character_check",
            VinMethod::LengthCheck => "length_check",
            VinMethod::LegacyLength => "legacy_length",
            VinMethod::CheckDigit => "check_digit",
        }
    }
}

// ============================================================================
// VALIDATION RESULT
// ============================================================================

/// Structured validation result. The validator never errors - callers branch
/// on `valid` and `method`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VinValidation {
    pub valid: bool,
    pub method: VinMethod,
    pub reason: String,
}

impl VinValidation {
    fn invalid(method: VinMethod, reason: impl Into<String>) -> Self {
        VinValidation {
            valid: false,
            method,
            reason: reason.into(),
        }
    }

    fn valid(method: VinMethod, reason: impl Into<String>) -> Self {
        VinValidation {
            valid: true,
            method,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// VALIDATOR
// ============================================================================

/// Validate an identifier string.
///
/// Rules, in order:
/// 1. blank → invalid
/// 2. placeholder prefix → invalid (regardless of length)
/// 3. character outside [A-HJ-NPR-Z0-9] → invalid
/// 4. length not 17 and not 4-16 → invalid
/// 5. length 4-16 → valid (legacy identifier, no checksum to verify)
/// 6. length 17 → check digit must match position 9
pub fn validate_vin(vin: &str) -> VinValidation {
    let trimmed = vin.trim();

    if trimmed.is_empty() {
        return VinValidation::invalid(VinMethod::Blank, "identifier is blank");
    }

    let upper = trimmed.to_uppercase();

    if is_placeholder_vin(&upper) {
        return VinValidation::invalid(
            VinMethod::PatternCheck,
            format!("matches placeholder pattern: {}", upper),
        );
    }

    if let Some(bad) = upper.chars().find(|c| !is_vin_char(*c)) {
        return VinValidation::invalid(
            VinMethod::CharacterCheck,
            format!("character '{}' is not allowed in a VIN", bad),
        );
    }

    let len = upper.len();
    if len != 17 && !(4..=16).contains(&len) {
        return VinValidation::invalid(
            VinMethod::LengthCheck,
            format!("length {} is not 17 or 4-16", len),
        );
    }

    if len != 17 {
        // Collector and legacy vehicles predate the standardized 17-char VIN
        return VinValidation::valid(
            VinMethod::LegacyLength,
            format!("legacy identifier, length {}", len),
        );
    }

    // Full 17-char VIN: verify the mod-11 weighted check digit (position 9)
    let chars: Vec<char> = upper.chars().collect();
    let expected = compute_check_digit(&chars);
    let actual = chars[8];

    if expected != actual {
        VinValidation::invalid(
            VinMethod::CheckDigit,
            format!("check digit mismatch: expected '{}', found '{}'", expected, actual),
        )
    } else {
        VinValidation::valid(
            VinMethod::CheckDigit,
            format!("check digit '{}' verified", actual),
        )
    }
}

/// VIN alphabet: digits plus A-Z excluding I, O, Q (easily confused with 1/0).
fn is_vin_char(c: char) -> bool {
    matches!(c, '0'..='9') || (matches!(c, 'A'..='Z') && !matches!(c, 'I' | 'O' | 'Q'))
}

/// ISO 3779 transliteration value for a VIN character.
fn transliterate(c: char) -> u32 {
    match c {
        '0'..='9' => c as u32 - '0' as u32,
        'A' => 1, 'B' => 2, 'C' => 3, 'D' => 4, 'E' => 5,
        'F' => 6, 'G' => 7, 'H' => 8,
        'J' => 1, 'K' => 2, 'L' => 3, 'M' => 4, 'N' => 5,
        'P' => 7, 'R' => 9,
        'S' => 2, 'T' => 3, 'U' => 4, 'V' => 5, 'W' => 6,
        'X' => 7, 'Y' => 8, 'Z' => 9,
        _ => 0,
    }
}

/// Position weights for the 17 VIN characters. Position 9 (the check digit
/// itself) has weight 0.
const CHECK_WEIGHTS: [u32; 17] = [8, 7, 6, 5, 4, 3, 2, 10, 0, 9, 8, 7, 6, 5, 4, 3, 2];

/// Compute the expected check digit for a 17-char VIN.
fn compute_check_digit(chars: &[char]) -> char {
    let sum: u32 = chars
        .iter()
        .zip(CHECK_WEIGHTS.iter())
        .map(|(c, w)| transliterate(*c) * w)
        .sum();

    match sum % 11 {
        10 => 'X',
        n => char::from_digit(n, 10).unwrap_or('0'),
    }
}

// ============================================================================
// VIN CLASSIFICATION (for matching)
// ============================================================================

/// How the matcher sees an identifier. Checksum validity is deliberately NOT
/// required for Real - a mistyped but manufacturer-assigned VIN still
/// identifies one physical vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VinClass {
    /// Present, non-blank, not a placeholder
    Real,

    /// Present but matches a placeholder prefix
    Placeholder,

    /// Missing or blank
    Absent,
}

impl VinClass {
    pub fn of(vin: Option<&str>) -> VinClass {
        match vin {
            None => VinClass::Absent,
            Some(v) if v.trim().is_empty() => VinClass::Absent,
            Some(v) if is_placeholder_vin(v) => VinClass::Placeholder,
            Some(_) => VinClass::Real,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
