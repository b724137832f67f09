//! Sequence reconciliation: the fewest moves that reorder one id list into
//! another.
//!
//! Ids that keep their relative order form a longest increasing subsequence
//! (by position in the target); everything else moves exactly once, so the
//! distance is `n - LIS`.

use crate::types::{DocumentId, Move};
use std::collections::{HashMap, HashSet};

/// Result of reconciling two orderings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Minimum number of single-element moves.
    pub distance: usize,
    /// Moves to apply, in order, to the `before` list.
    pub moves: Vec<Move>,
}

impl Reconciliation {
    pub fn is_noop(&self) -> bool {
        self.distance == 0
    }
}

/// Compute the moves that turn `before` into `after`.
///
/// Both lists are expected to hold the same ids; ids present in only one of
/// them are ignored. Duplicates after the first occurrence are ignored too.
pub fn reconcile(before: &[DocumentId], after: &[DocumentId]) -> Reconciliation {
    let (before, after) = common_order(before, after);
    if before == after {
        return Reconciliation::default();
    }

    let target: HashMap<&DocumentId, usize> =
        after.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    let ranks: Vec<usize> = before.iter().map(|id| target[id]).collect();
    let stable: HashSet<&DocumentId> = longest_increasing(&ranks)
        .into_iter()
        .map(|i| before[i])
        .collect();

    let mut current: Vec<&DocumentId> = before.clone();
    let mut moves = Vec::with_capacity(current.len() - stable.len());

    // Walk the target order; every unstable id is placed right after its
    // target predecessor, which is already in its final relative position.
    for (k, id) in after.iter().enumerate() {
        if stable.contains(id) {
            continue;
        }
        let Some(from) = current.iter().position(|x| x == id) else {
            continue;
        };
        current.remove(from);
        let to = if k == 0 {
            0
        } else {
            current
                .iter()
                .position(|x| *x == after[k - 1])
                .map_or(0, |p| p + 1)
        };
        current.insert(to, *id);
        moves.push(Move {
            id: (*id).clone(),
            from,
            to,
        });
    }

    Reconciliation {
        distance: moves.len(),
        moves,
    }
}

/// Apply moves to a list, in order. Out-of-range moves are skipped.
pub fn apply_moves(list: &mut Vec<DocumentId>, moves: &[Move]) {
    for mv in moves {
        if mv.from >= list.len() || list[mv.from] != mv.id {
            continue;
        }
        let id = list.remove(mv.from);
        let to = mv.to.min(list.len());
        list.insert(to, id);
    }
}

/// Restrict both lists to their shared, deduplicated ids.
fn common_order<'a>(
    before: &'a [DocumentId],
    after: &'a [DocumentId],
) -> (Vec<&'a DocumentId>, Vec<&'a DocumentId>) {
    let in_before: HashSet<&DocumentId> = before.iter().collect();
    let in_after: HashSet<&DocumentId> = after.iter().collect();

    let mut seen = HashSet::new();
    let b = before
        .iter()
        .filter(|id| in_after.contains(id) && seen.insert(*id))
        .collect();
    let mut seen = HashSet::new();
    let a = after
        .iter()
        .filter(|id| in_before.contains(id) && seen.insert(*id))
        .collect();
    (b, a)
}

/// Indices of one longest strictly increasing subsequence (patience sorting).
fn longest_increasing(values: &[usize]) -> Vec<usize> {
    // tails[k] = index of the smallest tail of an increasing run of length k+1
    let mut tails: Vec<usize> = Vec::new();
    let mut prev: Vec<Option<usize>> = vec![None; values.len()];

    for (i, &v) in values.iter().enumerate() {
        let pos = tails.partition_point(|&t| values[t] < v);
        if pos > 0 {
            prev[i] = Some(tails[pos - 1]);
        }
        if pos == tails.len() {
            tails.push(i);
        } else {
            tails[pos] = i;
        }
    }

    let mut out = Vec::with_capacity(tails.len());
    let mut cur = tails.last().copied();
    while let Some(i) = cur {
        out.push(i);
        cur = prev[i];
    }
    out.reverse();
    out
}
