/// Levenshtein distance over Unicode scalar values.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let m = a_chars.len();
    let n = b_chars.len();

    if m == 0 { return n; }
    if n == 0 { return m; }

    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for (i, &a_ch) in a_chars.iter().enumerate() {
        curr[0] = i + 1;
        for (j, &b_ch) in b_chars.iter().enumerate() {
            let cost = if a_ch == b_ch { 0 } else { 1 };
            curr[j + 1] = (prev[j + 1] + 1)
                .min(curr[j] + 1)
                .min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

/// `1 - distance / max(len)`, case-insensitive. Two empty strings are identical.
pub fn similarity(a: &str, b: &str) -> f32 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - edit_distance(&a, &b) as f32 / max_len as f32
}

/// Nearest canonical entry within `tolerance` (normalized edit distance).
///
/// Among acceptable candidates the smallest raw distance wins; earlier
/// entries win ties.
pub fn closest_match<'a, S: AsRef<str>>(value: &str, options: &'a [S], tolerance: f32) -> Option<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let lowered = value.to_lowercase();
    let value_len = lowered.chars().count();

    let mut best: Option<(&str, usize)> = None;
    for option in options {
        let option = option.as_ref();
        let candidate = option.to_lowercase();
        let distance = edit_distance(&lowered, &candidate);
        let max_len = value_len.max(candidate.chars().count()).max(1);
        let normalized = distance as f32 / max_len as f32;
        if normalized <= tolerance && best.map_or(true, |(_, d)| distance < d) {
            best = Some((option, distance));
        }
    }
    best.map(|(option, _)| option)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edit_distance_basic() {
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("abc", "abc"), 0);
        assert_eq!(edit_distance("Parañaque", "Paranaque"), 1);
    }

    #[test]
    fn similarity_is_case_insensitive() {
        assert!((similarity("MANILA", "manila") - 1.0).abs() < f32::EPSILON);
        assert!((similarity("", "") - 1.0).abs() < f32::EPSILON);
        assert!(similarity("abc", "xyz").abs() < f32::EPSILON);
    }

    #[test]
    fn closest_match_within_tolerance() {
        let places = ["Quezon City", "Manila", "Makati"];
        assert_eq!(closest_match("Quezn City", &places, 0.25), Some("Quezon City"));
        assert_eq!(closest_match("xqzv wrtp", &places, 0.25), None);
        assert_eq!(closest_match("   ", &places, 0.25), None);
    }

    #[test]
    fn closest_match_prefers_smaller_distance() {
        let options = ["Mandaue", "Mandaluyong"];
        // Both within 0.5; one edit from Mandaluyong, four from Mandaue.
        assert_eq!(closest_match("Mandaluong", &options, 0.5), Some("Mandaluyong"));
    }
}
