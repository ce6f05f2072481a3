//! Rules that relate fields to each other.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::template::{CrossFieldNames, PageSide};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossFieldRule {
    TestDateAfterBirthDate,
    AgeMatchesBirthDate,
    PreviousTestBeforeTestDate,
    PregnancyRequiresFemale,
    RequiredField,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Major,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossFieldError {
    pub rule: CrossFieldRule,
    pub severity: Severity,
    pub fields: Vec<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_value: Option<String>,
}

/// Accepts the normalized `MM/DD/YYYY` form plus dashes and ISO dates.
pub fn parse_form_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    ["%m/%d/%Y", "%m-%d-%Y", "%Y-%m-%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
}

fn is_affirmative(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "yes" | "y" | "true")
}

fn is_female(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "f" | "female")
}

/// Run every rule. `lookup` returns a field's (possibly corrected) scalar
/// value by name; `required` lists fields that must be non-empty.
pub fn check_cross_fields<'a, F>(
    names: &CrossFieldNames,
    lookup: F,
    required: &[(PageSide, String)],
    is_present: impl Fn(PageSide, &str) -> bool,
) -> Vec<CrossFieldError>
where
    F: Fn(&str) -> Option<&'a str>,
{
    let mut errors = Vec::new();
    let date = |name: &str| lookup(name).and_then(parse_form_date);

    let birth = date(names.birth_date.as_str());
    let test = date(names.test_date.as_str());

    if let (Some(test), Some(birth)) = (test, birth) {
        if test < birth {
            errors.push(CrossFieldError {
                rule: CrossFieldRule::TestDateAfterBirthDate,
                severity: Severity::Critical,
                fields: vec![names.test_date.clone(), names.birth_date.clone()],
                message: "Test date must be after birth date".into(),
                suggested_value: None,
            });
        }

        let stated_age = lookup(names.age.as_str()).and_then(|a| a.trim().parse::<i32>().ok());
        if let Some(stated) = stated_age {
            let calculated = test.year() - birth.year();
            if (calculated - stated).abs() > 1 {
                errors.push(CrossFieldError {
                    rule: CrossFieldRule::AgeMatchesBirthDate,
                    severity: Severity::Major,
                    fields: vec![names.age.clone(), names.birth_date.clone(), names.test_date.clone()],
                    message: format!("Age mismatch: extracted {stated}, calculated {calculated}"),
                    suggested_value: Some(calculated.to_string()),
                });
            }
        }
    }

    if let (Some(previous), Some(test)) = (date(names.previous_test_date.as_str()), test) {
        if previous >= test {
            errors.push(CrossFieldError {
                rule: CrossFieldRule::PreviousTestBeforeTestDate,
                severity: Severity::Major,
                fields: vec![names.previous_test_date.clone(), names.test_date.clone()],
                message: "Previous test date must be before current test date".into(),
                suggested_value: None,
            });
        }
    }

    if let (Some(pregnant), Some(sex)) = (lookup(names.pregnant.as_str()), lookup(names.sex.as_str())) {
        if is_affirmative(pregnant) && !sex.trim().is_empty() && !is_female(sex) {
            errors.push(CrossFieldError {
                rule: CrossFieldRule::PregnancyRequiresFemale,
                severity: Severity::Critical,
                fields: vec![names.pregnant.clone(), names.sex.clone()],
                message: "Pregnant status requires female sex".into(),
                suggested_value: None,
            });
        }
    }

    for (page, field) in required {
        if !is_present(*page, field) {
            errors.push(CrossFieldError {
                rule: CrossFieldRule::RequiredField,
                severity: Severity::Critical,
                fields: vec![field.clone()],
                message: format!("Required field \"{field}\" on {page} page is missing or empty"),
                suggested_value: None,
            });
        }
    }

    errors
}
