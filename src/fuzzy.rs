//! Pure fuzzy-matching primitives shared by scoring and cache validity

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchMetrics {
    pub prefix_matches: usize,
    pub edit_distance: usize,
}

/// Match the current word against a sort key, scanning at most
/// `|cword| + look_ahead` characters of the key.
pub fn metrics(cword: &str, sort_by: &str, look_ahead: usize) -> MatchMetrics {
    let budget = cword.chars().count() + look_ahead;
    let window: String = sort_by.chars().take(budget).collect();
    MatchMetrics {
        prefix_matches: prefix_matches(cword, &window),
        edit_distance: edit_distance(cword, &window),
    }
}

/// Length of the longest common leading run.
pub fn prefix_matches(lhs: &str, rhs: &str) -> usize {
    lhs.chars()
        .zip(rhs.chars())
        .take_while(|(l, r)| l == r)
        .count()
}

/// Levenshtein distance over characters.
pub fn edit_distance(lhs: &str, rhs: &str) -> usize {
    let lhs: Vec<char> = lhs.chars().collect();
    let rhs: Vec<char> = rhs.chars().collect();
    if lhs.is_empty() {
        return rhs.len();
    }
    if rhs.is_empty() {
        return lhs.len();
    }

    let mut prev: Vec<usize> = (0..=rhs.len()).collect();
    let mut row = vec![0usize; rhs.len() + 1];
    for (i, l) in lhs.iter().enumerate() {
        row[0] = i + 1;
        for (j, r) in rhs.iter().enumerate() {
            let substitute = prev[j] + usize::from(l != r);
            row[j + 1] = substitute.min(prev[j + 1] + 1).min(row[j] + 1);
        }
        std::mem::swap(&mut prev, &mut row);
    }
    prev[rhs.len()]
}

/// Multiset similarity of two strings in `[0, 1]`.
///
/// Refuses outright (0.0) when the lengths differ by more than
/// `look_ahead`; identical empty strings are fully similar.
pub fn multi_set_ratio(lhs: &str, rhs: &str, look_ahead: usize) -> f64 {
    let l_len = lhs.chars().count();
    let r_len = rhs.chars().count();
    if l_len.abs_diff(r_len) > look_ahead {
        return 0.0;
    }
    if l_len == 0 && r_len == 0 {
        return 1.0;
    }

    let mut counts = std::collections::HashMap::new();
    for c in lhs.chars() {
        *counts.entry(c).or_insert(0i64) += 1;
    }
    let mut matches = 0i64;
    for c in rhs.chars() {
        let count = counts.entry(c).or_insert(0);
        if *count > 0 {
            matches += 1;
        }
        *count -= 1;
    }
    2.0 * matches as f64 / (l_len + r_len) as f64
}
