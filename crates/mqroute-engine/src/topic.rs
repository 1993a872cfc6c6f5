//! Bus wildcard topics: `+` matches one level, `#` matches all remaining levels.

/// Does `topic` match the subscription `pattern`?
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    // `$`-prefixed system topics are never matched by a leading wildcard.
    if topic.starts_with('$') && (pattern.starts_with('+') || pattern.starts_with('#')) {
        return false;
    }

    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Sort key ranking patterns by specificity.
///
/// Level count first (zero-padded), then the pattern with `#` and `+` replaced
/// by the two lowest non-printable code points. Sorted descending, longer
/// patterns come first and, level by level, literals outrank `+` outrank `#`.
pub fn specificity_key(pattern: &str) -> String {
    let levels = pattern.split('/').count();
    let modified = pattern.replace('#', "\u{1}").replace('+', "\u{2}");
    format!("{levels:03}{modified}")
}

/// The entry with the most specific pattern matching `topic`.
pub fn most_specific<'a, T>(entries: &'a [(String, T)], topic: &str) -> Option<&'a (String, T)> {
    let mut ranked: Vec<(String, &'a (String, T))> = entries
        .iter()
        .map(|entry| (specificity_key(&entry.0), entry))
        .collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0));
    ranked
        .into_iter()
        .map(|(_, entry)| entry)
        .find(|(pattern, _)| topic_matches(pattern, topic))
}
