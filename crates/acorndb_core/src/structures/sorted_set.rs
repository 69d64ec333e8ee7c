//! Per-bucket sorted-set state.

use std::collections::{BTreeSet, HashMap};

/// An `f64` score with a total order, usable as a `BTreeSet` key.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Score(pub f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0).is_eq()
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// One sorted set: members ordered by `(score, member)` with a
/// secondary member-to-score map for point lookups.
#[derive(Debug, Default, Clone)]
struct SortedSet {
    by_score: BTreeSet<(Score, Vec<u8>)>,
    scores: HashMap<Vec<u8>, f64>,
}

impl SortedSet {
    fn insert(&mut self, score: f64, member: Vec<u8>) {
        if let Some(old) = self.scores.insert(member.clone(), score) {
            self.by_score.remove(&(Score(old), member.clone()));
        }
        self.by_score.insert((Score(score), member));
    }

    fn remove(&mut self, member: &[u8]) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.by_score.remove(&(Score(score), member.to_vec()));
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.scores.len()
    }

    /// Resolves a possibly negative 1-based rank range to zero-based
    /// bounds, clamped to the set size. Returns `None` for an empty or
    /// inverted range.
    fn resolve_ranks(&self, start: i64, end: i64) -> Option<(usize, usize)> {
        let n = self.len() as i64;
        if n == 0 {
            return None;
        }
        let fix = |rank: i64| -> i64 {
            if rank < 0 {
                n + rank + 1
            } else {
                rank
            }
        };
        let lo = fix(start).max(1);
        let hi = fix(end).min(n);
        if lo > hi {
            return None;
        }
        Some(((lo - 1) as usize, (hi - 1) as usize))
    }
}

/// In-memory state of one bucket's sorted sets: `key -> sorted set`.
#[derive(Debug, Default, Clone)]
pub(crate) struct SortedSetIndex {
    keys: HashMap<Vec<u8>, SortedSet>,
}

impl SortedSetIndex {
    /// Adds `member` with `score`, re-scoring it if already present.
    pub fn add(&mut self, key: &[u8], score: f64, member: Vec<u8>) {
        self.keys
            .entry(key.to_vec())
            .or_default()
            .insert(score, member);
    }

    /// Removes `member` from the sorted set at `key`.
    pub fn remove(&mut self, key: &[u8], member: &[u8]) -> bool {
        let Some(set) = self.keys.get_mut(key) else {
            return false;
        };
        let removed = set.remove(member);
        if set.len() == 0 {
            self.keys.remove(key);
        }
        removed
    }

    /// Returns the score of `member`, if present.
    pub fn score(&self, key: &[u8], member: &[u8]) -> Option<f64> {
        self.keys.get(key)?.scores.get(member).copied()
    }

    /// Returns true if the sorted set at `key` exists.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.keys.contains_key(key)
    }

    /// Number of members in the sorted set at `key`.
    pub fn card(&self, key: &[u8]) -> usize {
        self.keys.get(key).map_or(0, SortedSet::len)
    }

    /// Members with ranks in `[start, end]`, ascending by score.
    ///
    /// Ranks are 1-based; negative ranks count from the tail, so
    /// `(1, -1)` spans the whole set.
    pub fn range_by_rank(&self, key: &[u8], start: i64, end: i64) -> Vec<(f64, Vec<u8>)> {
        let Some(set) = self.keys.get(key) else {
            return Vec::new();
        };
        let Some((lo, hi)) = set.resolve_ranks(start, end) else {
            return Vec::new();
        };
        set.by_score
            .iter()
            .skip(lo)
            .take(hi - lo + 1)
            .map(|(score, member)| (score.0, member.clone()))
            .collect()
    }

    /// Removes members with ranks in `[start, end]`; returns the count.
    pub fn rem_range_by_rank(&mut self, key: &[u8], start: i64, end: i64) -> usize {
        let victims: Vec<Vec<u8>> = self
            .range_by_rank(key, start, end)
            .into_iter()
            .map(|(_, member)| member)
            .collect();
        for member in &victims {
            self.remove(key, member);
        }
        victims.len()
    }

    /// Returns true if the bucket holds no sorted sets.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
