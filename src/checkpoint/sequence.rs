//! Contains the [CommitPositionSequence]: the ordered buffer of
//! completed positions a [commit handler][super::commit::CommitHandler]
//! uses to find the highest position that is safe to persist.
//!
//! Naively persisting "the last position observed" under concurrent,
//! out-of-order completions can skip past a predecessor that has not
//! been durably handled yet, losing it on restart. The sequence solves
//! this by tracking a **receipt-order counter** next to each position:
//! the counter, not the store position, drives gap detection, because
//! store positions may have unrelated gaps (e.g. from filtered streams).

use std::collections::BTreeSet;

/// The completion record of one processed event: its global store
/// position, paired with the receipt-order counter assigned when the
/// event was delivered to the subscription.
///
/// The counter is transient and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitPosition {
    /// The global position of the processed event in the store-wide
    /// event log.
    pub position: u64,

    /// The receipt-order counter assigned at delivery time.
    pub sequence: u64,
}

impl PartialOrd for CommitPosition {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CommitPosition {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sequence
            .cmp(&other.sequence)
            .then(self.position.cmp(&other.position))
    }
}

/// An ordered buffer of [CommitPosition]s, keyed by their receipt-order
/// counter.
///
/// Check out the [module-level documentation][self] for more information.
#[derive(Debug, Clone, Default)]
pub struct CommitPositionSequence {
    positions: BTreeSet<CommitPosition>,
}

impl CommitPositionSequence {
    /// Creates a new, empty sequence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a new completed [CommitPosition] to the buffer.
    pub fn add(&mut self, position: CommitPosition) {
        self.positions.insert(position);
    }

    /// Returns the number of buffered positions.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Removes every buffered position, including the ones past a gap.
    ///
    /// Called after a successful commit: events past the gap have not
    /// been covered by the persisted position, and will simply be
    /// redelivered and re-added after a restart.
    pub fn clear(&mut self) {
        self.positions.clear();
    }

    /// Returns the last [CommitPosition] before a gap: the sole buffered
    /// element if there is one, or the end of the longest contiguous
    /// prefix of receipt-order counters otherwise.
    ///
    /// An empty buffer yields `None`: there is nothing safe to persist.
    pub fn first_before_gap(&self) -> Option<CommitPosition> {
        let mut positions = self.positions.iter();
        let mut last = positions.next()?;

        for position in positions {
            if position.sequence != last.sequence + 1 {
                break;
            }

            last = position;
        }

        Some(*last)
    }
}

impl FromIterator<CommitPosition> for CommitPositionSequence {
    fn from_iter<I: IntoIterator<Item = CommitPosition>>(iter: I) -> Self {
        Self {
            positions: iter.into_iter().collect(),
        }
    }
}
