//! Query alias resolution.
//!
//! A field's query answer may come back under several spellings. Lookup
//! order is fixed and auditable:
//! 1. aliases declared on the field definition
//! 2. the built-in alias table
//! 3. generated spellings: snake_case, lowerCamelCase, flattened lowercase
//! 4. the exact field name
//!
//! The first candidate is also the alias a field's query is sent under.

use std::collections::BTreeMap;

use crate::pipeline::vision::QueryAnswer;

/// Built-in (alias, field name) pairs for spellings no generator produces.
pub const ALIAS_TABLE: &[(&str, &str)] = &[
    ("dob", "birthDate"),
    ("date_of_birth", "birthDate"),
    ("birthdate", "birthDate"),
    ("philhealth", "philHealthNumber"),
    ("philhealth_no", "philHealthNumber"),
    ("mobile", "contactNumber"),
    ("mobile_number", "contactNumber"),
    ("phone", "contactNumber"),
    ("control_no", "controlNumber"),
    ("date_of_test", "testDate"),
    ("test_result", "testResult"),
    ("facility", "testingFacility"),
    ("facility_name", "testingFacility"),
    ("current_residence", "currentResidenceCity"),
    ("permanent_residence", "permanentResidenceCity"),
    ("pregnant", "isPregnant"),
];

/// Ordered, de-duplicated alias candidates for `field_name`.
pub fn alias_candidates(field_name: &str, declared: &[String]) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::new();
    let mut push = |alias: String| {
        if !alias.is_empty() && !candidates.contains(&alias) {
            candidates.push(alias);
        }
    };

    for alias in declared {
        push(alias.trim().to_string());
    }
    for (alias, field) in ALIAS_TABLE {
        if *field == field_name {
            push((*alias).to_string());
        }
    }
    push(to_snake_case(field_name));
    push(to_lower_camel_case(field_name));
    push(field_name.replace('_', "").to_lowercase());
    push(field_name.to_string());

    candidates
}

/// First candidate with a non-empty answer.
pub fn resolve_answer<'a>(
    answers: &'a BTreeMap<String, QueryAnswer>,
    candidates: &'a [String],
) -> Option<(&'a str, &'a QueryAnswer)> {
    candidates.iter().find_map(|alias| {
        answers
            .get(alias)
            .filter(|a| !a.text.trim().is_empty())
            .map(|a| (alias.as_str(), a))
    })
}

/// `testDate` → `test_date`, `HIVTest` → `hiv_test`.
pub fn to_snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let next = chars.get(i + 1).copied();
            let boundary = match prev {
                Some(p) if p.is_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_uppercase() => next.is_some_and(|n| n.is_lowercase()),
                _ => false,
            };
            if boundary && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// `test_date` → `testDate`. Names without underscores pass through.
pub fn to_lower_camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for c in name.chars() {
        if c == '_' {
            upper_next = !out.is_empty();
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}
