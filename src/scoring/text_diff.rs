use std::collections::HashSet;

use crate::utils::normalize_text;

/// Position-mismatch score between two text payloads after normalization.
pub fn score_text(previous: &str, current: &str) -> f64 {
    if previous.is_empty() || current.is_empty() || previous == current {
        return 0.0;
    }
    let prev: Vec<char> = normalize_text(previous).chars().collect();
    let curr: Vec<char> = normalize_text(current).chars().collect();
    if prev == curr {
        return 0.0;
    }

    let longer = prev.len().max(curr.len());
    let shared = prev.len().min(curr.len());
    let mismatches = prev[..shared]
        .iter()
        .zip(curr[..shared].iter())
        .filter(|(a, b)| a != b)
        .count();
    let length_delta = longer - shared;

    ((mismatches + length_delta) as f64 / longer as f64).clamp(0.0, 1.0)
}

/// Short human-readable summary of what changed between two text payloads.
pub fn summarize_text_change(previous: &str, current: &str) -> String {
    let prev_lines: HashSet<&str> = previous.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let curr_lines: HashSet<&str> = current.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let added = curr_lines.difference(&prev_lines).count();
    let removed = prev_lines.difference(&curr_lines).count();

    if added == 0 && removed == 0 {
        return "Content changed (formatting or ordering only).".to_string();
    }
    let mut summary = format!("Content changed: {added} line(s) added, {removed} line(s) removed.");
    if let Some(first) = current
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !prev_lines.contains(l))
    {
        let preview: String = first.chars().take(120).collect();
        summary.push_str(&format!(" First new line: \"{preview}\""));
    }
    summary
}
