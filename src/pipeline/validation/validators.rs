//! Per-type value validators.
//!
//! Each validator normalizes common OCR confusions first (letter O read for
//! zero, I or l read for one), then checks the value's shape. A validator
//! never panics on garbage; it reports `is_valid = false` with a low
//! confidence and no correction.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;

use super::fuzzy::closest_match;
use super::FieldCheck;

static CONTROL_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^[A-Z]{2,4}\d{6,10}$").unwrap());

static DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{2})[-/](\d{2})[-/](\d{4})").unwrap());

static HEALTH_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{2})-?(\d{9})-?(\d)$").unwrap());

static PHONE_SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s\-()]").unwrap());

const MIN_PLACE_LEN: usize = 3;
const MIN_FACILITY_LEN: usize = 5;

fn strip_whitespace(value: &str) -> String {
    value.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Digit look-alikes: O → 0, I → 1. `lower_l` also maps l → 1.
fn fix_digit_lookalikes(value: &str, lower_l: bool) -> String {
    value
        .chars()
        .map(|c| match c {
            'O' => '0',
            'I' => '1',
            'l' if lower_l => '1',
            other => other,
        })
        .collect()
}

pub fn validate_control_number(value: &str) -> FieldCheck {
    let cleaned = fix_digit_lookalikes(&strip_whitespace(value), false);
    if CONTROL_NUMBER.is_match(&cleaned) {
        FieldCheck::valid(cleaned.to_uppercase(), 0.95)
    } else {
        FieldCheck::invalid(0.3)
    }
}

/// `MM/DD/YYYY` or `MM-DD-YYYY` anywhere in the value, normalized to slashes.
/// The date must exist on the calendar, years 1900-2100.
pub fn validate_date(value: &str) -> FieldCheck {
    let cleaned = fix_digit_lookalikes(&strip_whitespace(value), true);
    let Some(caps) = DATE.captures(&cleaned) else {
        return FieldCheck::invalid(0.2);
    };
    let (month, day, year) = (&caps[1], &caps[2], &caps[3]);
    let parsed = (|| {
        let m: u32 = month.parse().ok()?;
        let d: u32 = day.parse().ok()?;
        let y: i32 = year.parse().ok()?;
        if !(1900..=2100).contains(&y) {
            return None;
        }
        NaiveDate::from_ymd_opt(y, m, d)
    })();

    match parsed {
        Some(_) => FieldCheck::valid(format!("{month}/{day}/{year}"), 0.9),
        None => FieldCheck::invalid(0.2),
    }
}

/// Mobile numbers: `09` + 9 digits, `+639` + 9 digits, or a bare 10-digit
/// number starting with 9 (gets a leading 0 at lower confidence).
pub fn validate_phone(value: &str) -> FieldCheck {
    let cleaned = fix_digit_lookalikes(&PHONE_SEPARATORS.replace_all(value, ""), true);
    let digits_after = |prefix: &str| {
        cleaned
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.chars().all(|c| c.is_ascii_digit()))
    };

    if cleaned.len() == 11 && digits_after("09") {
        return FieldCheck::valid(cleaned, 0.9);
    }
    if cleaned.len() == 13 && digits_after("+639") {
        return FieldCheck::valid(cleaned, 0.9);
    }
    if cleaned.len() == 10 && digits_after("9") {
        return FieldCheck::valid(format!("0{cleaned}"), 0.7);
    }
    FieldCheck::invalid(0.2)
}

/// National health ID, normalized to `XX-XXXXXXXXX-X`.
pub fn validate_health_id(value: &str) -> FieldCheck {
    let cleaned = fix_digit_lookalikes(&strip_whitespace(value), false);
    match HEALTH_ID.captures(&cleaned) {
        Some(caps) => FieldCheck::valid(format!("{}-{}-{}", &caps[1], &caps[2], &caps[3]), 0.85),
        None => FieldCheck::invalid(0.2),
    }
}

pub fn validate_place(value: &str, places: &[String], tolerance: f32) -> FieldCheck {
    let trimmed = value.trim();
    if trimmed.chars().count() < MIN_PLACE_LEN {
        return FieldCheck::invalid(0.1);
    }
    match closest_match(trimmed, places, tolerance) {
        Some(matched) => FieldCheck::valid(matched.to_string(), 0.8),
        None => FieldCheck::invalid(0.3),
    }
}

/// Unknown facilities are kept as written: invalid, uncorrected, but with
/// moderate confidence since new facilities do appear.
pub fn validate_facility(value: &str, facilities: &[String], tolerance: f32) -> FieldCheck {
    let trimmed = value.trim();
    if trimmed.chars().count() < MIN_FACILITY_LEN {
        return FieldCheck::invalid(0.1);
    }
    match closest_match(trimmed, facilities, tolerance) {
        Some(matched) => FieldCheck::valid(matched.to_string(), 0.75),
        None => FieldCheck::invalid(0.4),
    }
}

/// Closed value set, e.g. test results. Matches are case-insensitive.
pub fn validate_categorical<S: AsRef<str>>(value: &str, allowed: &[S], tolerance: f32) -> FieldCheck {
    match closest_match(value, allowed, tolerance) {
        Some(matched) => FieldCheck::valid(matched.to_string(), 0.9),
        None => FieldCheck::invalid(0.2),
    }
}

/// Whole years, 0-120.
pub fn validate_age(value: &str) -> FieldCheck {
    // First digit run only: "2 yrs 5 mos" is 2, not 25.
    let digits: String = fix_digit_lookalikes(value, false)
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    match digits.parse::<u32>() {
        Ok(age) if age <= 120 => FieldCheck::valid(age.to_string(), 0.95),
        _ => FieldCheck::invalid(0.2),
    }
}

/// `M` / `F`, accepting the spelled-out forms.
pub fn validate_sex(value: &str) -> FieldCheck {
    match value.trim().to_uppercase().as_str() {
        "M" | "MALE" => FieldCheck::valid("M".into(), 0.95),
        "F" | "FEMALE" => FieldCheck::valid("F".into(), 0.95),
        _ => FieldCheck::invalid(0.2),
    }
}

/// Default categories for test-result style fields without `allowed_values`.
pub const DEFAULT_RESULT_CATEGORIES: &[&str] = &["Positive", "Negative", "Pending", "Inconclusive"];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::validation::lists::CanonicalLists;

    fn corrected(check: &FieldCheck) -> Option<&str> {
        check.corrected.as_deref()
    }

    #[test]
    fn phone_letter_o_corrected_to_zero() {
        let check = validate_phone("O9123456789");
        assert!(check.is_valid);
        assert_eq!(corrected(&check), Some("09123456789"));
        assert!((check.confidence - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn phone_formats() {
        assert_eq!(corrected(&validate_phone("0912-345-6789")), Some("09123456789"));
        assert_eq!(corrected(&validate_phone("+63 912 345 6789")), Some("+639123456789"));
        let bare = validate_phone("9123456789");
        assert_eq!(corrected(&bare), Some("09123456789"));
        assert!((bare.confidence - 0.7).abs() < f32::EPSILON);
        assert!(!validate_phone("12345").is_valid);
        assert!(!validate_phone("09ABCDEFGHI").is_valid);
    }

    #[test]
    fn date_normalized_and_calendar_checked() {
        let check = validate_date("O3-l5-2O24");
        assert!(check.is_valid);
        assert_eq!(corrected(&check), Some("03/15/2024"));
        assert!(!validate_date("13/01/2024").is_valid);
        assert!(!validate_date("02/30/2024").is_valid);
        assert!(!validate_date("01/01/1850").is_valid);
        assert!(!validate_date("yesterday").is_valid);
    }

    #[test]
    fn control_number_uppercased() {
        let check = validate_control_number("ab 12345678");
        assert!(check.is_valid);
        assert_eq!(corrected(&check), Some("AB12345678"));
        let check = validate_control_number("X123");
        assert!(!check.is_valid);
        assert!((check.confidence - 0.3).abs() < f32::EPSILON);
    }

    #[test]
    fn health_id_formatted() {
        assert_eq!(
            corrected(&validate_health_id("12 345678901 2")),
            Some("12-345678901-2")
        );
        assert_eq!(corrected(&validate_health_id("12-345678901-2")), Some("12-345678901-2"));
        assert!(!validate_health_id("12-3456").is_valid);
    }

    #[test]
    fn health_id_rejects_extra_digits() {
        assert!(!validate_health_id("1234567890123456").is_valid);
        assert!(!validate_health_id("912-345678901-23").is_valid);
    }

    #[test]
    fn place_fuzzy_correction() {
        let lists = CanonicalLists::default();
        let check = validate_place("Quezn City", &lists.places, 0.25);
        assert!(check.is_valid);
        assert_eq!(corrected(&check), Some("Quezon City"));

        let garbage = validate_place("xqzv wrtp kk", &lists.places, 0.25);
        assert!(!garbage.is_valid);
        assert!(garbage.corrected.is_none());

        assert!((validate_place("ab", &lists.places, 0.25).confidence - 0.1).abs() < f32::EPSILON);
    }

    #[test]
    fn facility_fuzzy_correction() {
        let lists = CanonicalLists::default();
        let check = validate_facility("San Lazaro Hospitl", &lists.facilities, 0.3);
        assert_eq!(corrected(&check), Some("San Lazaro Hospital"));
        let unknown = validate_facility("Barangay Health Station 7", &lists.facilities, 0.3);
        assert!(!unknown.is_valid);
        assert!((unknown.confidence - 0.4).abs() < f32::EPSILON);
    }

    #[test]
    fn categorical_matches_case_insensitively() {
        let allowed = DEFAULT_RESULT_CATEGORIES;
        assert_eq!(corrected(&validate_categorical("NEGATlVE", allowed, 0.25)), Some("Negative"));
        assert!(!validate_categorical("maybe", allowed, 0.25).is_valid);
    }

    #[test]
    fn age_and_sex() {
        assert_eq!(corrected(&validate_age("2O")), Some("20"));
        assert_eq!(corrected(&validate_age("34 yrs")), Some("34"));
        assert!(!validate_age("130").is_valid);
        assert!(!validate_age("").is_valid);
        assert_eq!(corrected(&validate_age("2 yrs 5 mos")), Some("2"));
        assert_eq!(corrected(&validate_sex(" female ")), Some("F"));
        assert_eq!(corrected(&validate_sex("m")), Some("M"));
        assert!(!validate_sex("X").is_valid);
    }
}
