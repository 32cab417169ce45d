//! Two-tier input buffer of recent verdicts.
//!
//! New verdicts land in the small hot tier; overflow spills into the
//! cold tier. Since the cold tier is by far the larger blob, branches
//! whose cold tier did not change in an update can skip rewriting it.
//! Once the cold tier fills, the whole buffer is compacted: analyzed
//! for changepoints, segmentized, and everything before the last
//! changepoint evicted into stored segments.

use std::ops::Range;

use chrono::{DateTime, Utc};
use ft_common::Error;
use serde::{Deserialize, Serialize};

use crate::detector::{Changepoint, ChangepointDetector};
use crate::segment::{Counts, Segment, SegmentState};
use crate::verdict::{latest_unexpected_hour, PositionVerdict};

/// An ordered run of verdicts, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct History {
    pub verdicts: Vec<PositionVerdict>,
}

impl History {
    pub fn len(&self) -> usize {
        self.verdicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verdicts.is_empty()
    }

    pub fn first_position(&self) -> Option<i64> {
        self.verdicts.first().map(|v| v.commit_position)
    }

    /// Whether any stored verdict sits at `position`.
    pub fn contains_position(&self, position: i64) -> bool {
        let idx = self
            .verdicts
            .partition_point(|v| v.commit_position < position);
        self.verdicts
            .get(idx)
            .is_some_and(|v| v.commit_position == position)
    }

    /// Inserts keeping `(commit_position, hour)` order. Equal keys keep
    /// arrival order.
    fn insert_sorted(&mut self, verdict: PositionVerdict) {
        let key = verdict.sort_key();
        let idx = self.verdicts.partition_point(|v| v.sort_key() <= key);
        self.verdicts.insert(idx, verdict);
    }
}

/// The buffered recent history of one test branch.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    pub hot_capacity: usize,
    pub cold_capacity: usize,
    pub hot: History,
    pub cold: History,
    /// Set when the cold tier changed since the entry was loaded, so
    /// the store can skip rewriting an unchanged cold blob.
    pub is_cold_dirty: bool,
}

impl Buffer {
    pub fn new(hot_capacity: usize, cold_capacity: usize) -> Self {
        Buffer {
            hot_capacity,
            cold_capacity,
            hot: History::default(),
            cold: History::default(),
            is_cold_dirty: false,
        }
    }

    pub fn total_len(&self) -> usize {
        self.hot.len() + self.cold.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hot.is_empty() && self.cold.is_empty()
    }

    /// First (oldest) buffered position of each tier.
    pub fn oldest_positions(&self) -> (Option<i64>, Option<i64>) {
        (self.hot.first_position(), self.cold.first_position())
    }

    /// Inserts new verdicts into the hot tier, spilling the oldest
    /// entries to cold when the hot tier overflows.
    ///
    /// A position already present in the hot tier is rejected: the same
    /// position arriving twice in quick succession is a re-delivery,
    /// not new data. The same position recurring after it spilled to
    /// cold is legal and stored alongside the earlier verdict.
    pub fn insert(&mut self, verdicts: Vec<PositionVerdict>) -> ft_common::Result<()> {
        for verdict in verdicts {
            if self.hot.contains_position(verdict.commit_position) {
                return Err(Error::DuplicatePosition {
                    position: verdict.commit_position,
                });
            }
            self.hot.insert_sorted(verdict);
        }
        self.spill_hot_overflow();
        Ok(())
    }

    fn spill_hot_overflow(&mut self) {
        let overflow = self.hot.len().saturating_sub(self.hot_capacity);
        if overflow == 0 {
            return;
        }
        let spilled: Vec<PositionVerdict> = self.hot.verdicts.drain(..overflow).collect();
        for verdict in spilled {
            self.cold.insert_sorted(verdict);
        }
        self.is_cold_dirty = true;
    }

    /// Whether the cold tier has reached capacity and the buffer must
    /// be compacted before more verdicts arrive.
    pub fn should_compact(&self) -> bool {
        self.cold.len() >= self.cold_capacity
    }

    /// Moves every hot verdict into the cold tier.
    pub fn promote_hot(&mut self) {
        if self.hot.is_empty() {
            return;
        }
        let hot = std::mem::take(&mut self.hot);
        for verdict in hot.verdicts {
            self.cold.insert_sorted(verdict);
        }
        self.is_cold_dirty = true;
    }

    /// All buffered verdicts in order, without disturbing the tiers.
    pub fn merged_view(&self) -> Vec<PositionVerdict> {
        let cold = &self.cold.verdicts;
        let hot = &self.hot.verdicts;
        let mut out = Vec::with_capacity(cold.len() + hot.len());
        let (mut i, mut j) = (0, 0);
        while i < cold.len() && j < hot.len() {
            if cold[i].sort_key() <= hot[j].sort_key() {
                out.push(cold[i].clone());
                i += 1;
            } else {
                out.push(hot[j].clone());
                j += 1;
            }
        }
        out.extend_from_slice(&cold[i..]);
        out.extend_from_slice(&hot[j..]);
        out
    }

    /// Removes and returns the oldest `count` verdicts. The buffer must
    /// have been promoted first so the cold tier holds everything.
    pub fn evict_first(&mut self, count: usize) -> Vec<PositionVerdict> {
        debug_assert!(self.hot.is_empty(), "evict_first on an unpromoted buffer");
        let count = count.min(self.cold.len());
        if count == 0 {
            return Vec::new();
        }
        self.is_cold_dirty = true;
        self.cold.verdicts.drain(..count).collect()
    }

    /// Promotes the hot tier and segmentizes the full history.
    ///
    /// Returns the buffer's segmentation, oldest first; the last
    /// segment is the still-open regime. The caller decides which
    /// prefix of the buffer to evict into stored segments.
    pub fn compact(
        &mut self,
        detector: &dyn ChangepointDetector,
    ) -> ft_common::Result<Vec<BufferSegment>> {
        if !self.should_compact() {
            return Err(Error::InvariantViolation(
                "compaction requested before the cold tier filled".into(),
            ));
        }
        self.promote_hot();
        let changepoints = detector.analyze(&self.cold.verdicts);
        Ok(segmentize(&self.cold.verdicts, &changepoints))
    }
}

/// A maximal run of buffered verdicts between detected changepoints.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferSegment {
    pub has_start_changepoint: bool,
    pub start_position: i64,
    pub start_hour: DateTime<Utc>,
    pub start_position_lower_bound_99: Option<i64>,
    pub start_position_upper_bound_99: Option<i64>,
    pub end_position: i64,
    pub end_hour: DateTime<Utc>,
    pub most_recent_unexpected_result_hour: Option<DateTime<Utc>>,
    pub counts: Counts,
    /// Index range of the covered verdicts in the segmentized history.
    pub verdict_range: Range<usize>,
}

impl BufferSegment {
    pub fn verdict_count(&self) -> usize {
        self.verdict_range.len()
    }

    /// Stored form of a regime whose verdicts have all left the buffer.
    pub fn to_finalized(&self) -> Segment {
        Segment {
            state: SegmentState::Finalized,
            has_start_changepoint: self.has_start_changepoint,
            start_position: self.start_position,
            start_hour: self.start_hour,
            start_position_lower_bound_99: self.start_position_lower_bound_99,
            start_position_upper_bound_99: self.start_position_upper_bound_99,
            end_position: Some(self.end_position),
            end_hour: Some(self.end_hour),
            most_recent_unexpected_result_hour: self.most_recent_unexpected_result_hour,
            finalized_counts: self.counts,
        }
    }

    /// Stored marker for the still-open regime. Counts stay empty: the
    /// covered verdicts remain in the buffer.
    pub fn to_finalizing_marker(&self) -> Segment {
        Segment {
            state: SegmentState::Finalizing,
            has_start_changepoint: self.has_start_changepoint,
            start_position: self.start_position,
            start_hour: self.start_hour,
            start_position_lower_bound_99: self.start_position_lower_bound_99,
            start_position_upper_bound_99: self.start_position_upper_bound_99,
            end_position: None,
            end_hour: None,
            most_recent_unexpected_result_hour: None,
            finalized_counts: Counts::default(),
        }
    }

    /// Closes a stored finalizing segment with this buffer segment's
    /// tail. Start identity comes from the stored segment; counts sum;
    /// the end comes from the buffer. The same rule finalizes a regime
    /// during compaction and materializes it at export.
    pub fn close_into(&self, mut finalizing: Segment) -> Segment {
        finalizing.state = SegmentState::Finalized;
        finalizing.finalized_counts.add(&self.counts);
        finalizing.end_position = Some(self.end_position);
        finalizing.end_hour = Some(self.end_hour);
        finalizing.observe_unexpected_hour(self.most_recent_unexpected_result_hour);
        finalizing
    }
}

/// Cuts a history into segments at the given changepoints.
///
/// Changepoints that are out of range or out of order are ignored.
/// The first segment never starts with a changepoint: it continues
/// whatever regime preceded the buffer.
pub fn segmentize(history: &[PositionVerdict], changepoints: &[Changepoint]) -> Vec<BufferSegment> {
    if history.is_empty() {
        return Vec::new();
    }
    let mut cuts: Vec<&Changepoint> = Vec::with_capacity(changepoints.len());
    let mut last = 0usize;
    for cp in changepoints {
        if cp.index > last && cp.index < history.len() {
            cuts.push(cp);
            last = cp.index;
        }
    }

    let mut bounds = Vec::with_capacity(cuts.len() + 2);
    bounds.push(0);
    bounds.extend(cuts.iter().map(|cp| cp.index));
    bounds.push(history.len());

    let mut segments = Vec::with_capacity(cuts.len() + 1);
    for (i, window) in bounds.windows(2).enumerate() {
        let (lo, hi) = (window[0], window[1]);
        let opening = if i == 0 { None } else { Some(cuts[i - 1]) };
        let span = &history[lo..hi];
        let mut counts = Counts::default();
        for verdict in span {
            counts.record_verdict(verdict);
        }
        segments.push(BufferSegment {
            has_start_changepoint: opening.is_some(),
            start_position: span[0].commit_position,
            start_hour: span[0].hour,
            start_position_lower_bound_99: opening.map(|cp| cp.lower_bound_99),
            start_position_upper_bound_99: opening.map(|cp| cp.upper_bound_99),
            end_position: span[span.len() - 1].commit_position,
            end_hour: span[span.len() - 1].hour,
            most_recent_unexpected_result_hour: latest_unexpected_hour(span),
            counts,
            verdict_range: lo..hi,
        });
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hour(h: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(h * 3600, 0).unwrap()
    }

    fn pass(position: i64) -> PositionVerdict {
        PositionVerdict::simple_pass(position, hour(position))
    }

    fn positions(history: &History) -> Vec<i64> {
        history.verdicts.iter().map(|v| v.commit_position).collect()
    }

    #[test]
    fn insert_keeps_position_order() {
        let mut buffer = Buffer::new(10, 100);
        buffer
            .insert(vec![pass(5), pass(1), pass(9), pass(3)])
            .unwrap();
        assert_eq!(positions(&buffer.hot), vec![1, 3, 5, 9]);
        assert!(buffer.cold.is_empty());
        assert!(!buffer.is_cold_dirty);
    }

    #[test]
    fn duplicate_position_in_hot_is_rejected() {
        let mut buffer = Buffer::new(10, 100);
        buffer.insert(vec![pass(5)]).unwrap();
        let err = buffer.insert(vec![pass(5)]).unwrap_err();
        assert!(matches!(err, Error::DuplicatePosition { position: 5 }));
    }

    #[test]
    fn duplicate_position_across_tiers_is_allowed() {
        let mut buffer = Buffer::new(2, 100);
        buffer.insert(vec![pass(1), pass(2), pass(3)]).unwrap();
        // Position 1 spilled to cold.
        assert_eq!(positions(&buffer.cold), vec![1]);
        buffer.insert(vec![pass(1)]).unwrap();
        assert_eq!(buffer.total_len(), 4);
    }

    #[test]
    fn overflow_spills_oldest_to_cold() {
        let mut buffer = Buffer::new(3, 100);
        buffer
            .insert(vec![pass(4), pass(2), pass(6), pass(1), pass(5)])
            .unwrap();
        assert_eq!(positions(&buffer.hot), vec![4, 5, 6]);
        assert_eq!(positions(&buffer.cold), vec![1, 2]);
        assert!(buffer.is_cold_dirty);
    }

    #[test]
    fn should_compact_at_cold_capacity() {
        let mut buffer = Buffer::new(2, 4);
        buffer.insert((1..=6).map(pass).collect()).unwrap();
        assert_eq!(buffer.cold.len(), 4);
        assert!(buffer.should_compact());
    }

    #[test]
    fn compact_before_cold_fills_is_an_invariant_violation() {
        let mut buffer = Buffer::new(2, 100);
        buffer.insert(vec![pass(1)]).unwrap();
        let detector = crate::detector::BayesianChangepointDetector::new(
            crate::detector::DetectorConfig::default(),
        )
        .unwrap();
        assert!(matches!(
            buffer.compact(&detector),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn promote_hot_empties_the_hot_tier() {
        let mut buffer = Buffer::new(3, 100);
        buffer.insert(vec![pass(10), pass(20)]).unwrap();
        buffer.promote_hot();
        assert!(buffer.hot.is_empty());
        assert_eq!(positions(&buffer.cold), vec![10, 20]);
        assert!(buffer.is_cold_dirty);
    }

    #[test]
    fn merged_view_interleaves_tiers() {
        let mut buffer = Buffer::new(2, 100);
        buffer
            .insert(vec![pass(1), pass(4), pass(2), pass(3)])
            .unwrap();
        // Hot holds 3, 4; cold holds 1, 2.
        let merged: Vec<i64> = buffer
            .merged_view()
            .iter()
            .map(|v| v.commit_position)
            .collect();
        assert_eq!(merged, vec![1, 2, 3, 4]);
        // The view does not disturb the tiers.
        assert_eq!(positions(&buffer.hot), vec![3, 4]);
        assert_eq!(positions(&buffer.cold), vec![1, 2]);
    }

    #[test]
    fn evict_first_drains_the_oldest_prefix() {
        let mut buffer = Buffer::new(2, 100);
        buffer.insert((1..=6).map(pass).collect()).unwrap();
        buffer.promote_hot();
        let evicted = buffer.evict_first(4);
        assert_eq!(
            evicted.iter().map(|v| v.commit_position).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        assert_eq!(positions(&buffer.cold), vec![5, 6]);
    }

    #[test]
    fn segmentize_without_changepoints_yields_one_segment() {
        let history: Vec<_> = (1..=5).map(pass).collect();
        let segments = segmentize(&history, &[]);
        assert_eq!(segments.len(), 1);
        let seg = &segments[0];
        assert!(!seg.has_start_changepoint);
        assert_eq!(seg.start_position, 1);
        assert_eq!(seg.end_position, 5);
        assert_eq!(seg.counts.total_verdicts, 5);
        assert_eq!(seg.verdict_range, 0..5);
        assert_eq!(seg.most_recent_unexpected_result_hour, None);
    }

    #[test]
    fn segmentize_cuts_at_changepoints() {
        let history: Vec<_> = (1..=10).map(pass).collect();
        let cps = vec![Changepoint {
            index: 6,
            position: 7,
            lower_bound_99: 5,
            upper_bound_99: 8,
        }];
        let segments = segmentize(&history, &cps);
        assert_eq!(segments.len(), 2);
        assert!(!segments[0].has_start_changepoint);
        assert_eq!(segments[0].verdict_range, 0..6);
        assert_eq!(segments[0].end_position, 6);
        let open = &segments[1];
        assert!(open.has_start_changepoint);
        assert_eq!(open.start_position, 7);
        assert_eq!(open.start_position_lower_bound_99, Some(5));
        assert_eq!(open.start_position_upper_bound_99, Some(8));
        assert_eq!(open.verdict_range, 6..10);
    }

    #[test]
    fn segmentize_ignores_malformed_changepoints() {
        let history: Vec<_> = (1..=4).map(pass).collect();
        let cps = vec![
            Changepoint {
                index: 0,
                position: 1,
                lower_bound_99: 1,
                upper_bound_99: 1,
            },
            Changepoint {
                index: 2,
                position: 3,
                lower_bound_99: 2,
                upper_bound_99: 3,
            },
            Changepoint {
                index: 2,
                position: 3,
                lower_bound_99: 2,
                upper_bound_99: 3,
            },
            Changepoint {
                index: 9,
                position: 99,
                lower_bound_99: 9,
                upper_bound_99: 9,
            },
        ];
        let segments = segmentize(&history, &cps);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].verdict_range, 0..2);
        assert_eq!(segments[1].verdict_range, 2..4);
    }

    #[test]
    fn close_into_merges_counts_and_takes_the_buffer_end() {
        let history: Vec<_> = (6..=9).map(pass).collect();
        let buffer_segment = segmentize(&history, &[]).remove(0);

        let mut finalizing = buffer_segment.to_finalizing_marker();
        finalizing.start_position = 1;
        finalizing.start_hour = hour(1);
        finalizing.finalized_counts.total_verdicts = 5;

        let closed = buffer_segment.close_into(finalizing);
        assert_eq!(closed.state, SegmentState::Finalized);
        assert_eq!(closed.start_position, 1);
        assert_eq!(closed.end_position, Some(9));
        assert_eq!(closed.finalized_counts.total_verdicts, 9);
    }
}
