//! Plurality gate over arbitrary values.

use std::collections::HashMap;
use std::hash::Hash;

use crate::domain::Decision;

/// Outcome of [`plurality`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluralityOutcome<'a, T> {
    /// Unique most frequent value; `None` on a tie or empty input.
    pub winner: Option<&'a T>,
    /// Count of the most frequent value(s).
    pub top_count: usize,
    pub decision: Decision,
}

/// Most frequent value wins if it is unique and seen at least `floor` times.
///
/// A tie for the top count is "no majority" and fails.
pub fn plurality<T: Eq + Hash>(values: &[T], floor: usize) -> PluralityOutcome<'_, T> {
    let mut counts: HashMap<&T, usize> = HashMap::new();
    for v in values {
        *counts.entry(v).or_default() += 1;
    }

    let top_count = counts.values().copied().max().unwrap_or(0);
    let mut leaders = counts.iter().filter(|(_, c)| **c == top_count).map(|(v, _)| *v);
    let winner = match (leaders.next(), leaders.next()) {
        (Some(only), None) => Some(only),
        _ => None,
    };

    let decision = if winner.is_some() && top_count >= floor {
        Decision::Pass
    } else {
        Decision::Fail
    };
    PluralityOutcome {
        winner,
        top_count,
        decision,
    }
}
