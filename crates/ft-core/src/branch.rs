//! Per-branch analysis state and its persisted form.
//!
//! An [`Entry`] is the live aggregate for one (project, test, variant,
//! ref) branch: the input buffer, the open finalizing segment, the
//! closed finalized segments, and eviction statistics. [`Entry::ingest`]
//! drives the whole lifecycle: buffer insert, compaction when the cold
//! tier fills, and retention on every update.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AnalysisConfig;
use crate::detector::ChangepointDetector;
use crate::inputbuffer::{segmentize, Buffer, BufferSegment, History};
use crate::retention;
use crate::segment::Segment;
use crate::statistics::Statistics;
use crate::verdict::{latest_unexpected_hour, PositionVerdict};
use ft_common::{BranchKey, SourceRef, Variant};

/// Live analysis state for one test branch.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub key: BranchKey,
    pub variant: Variant,
    pub source_ref: SourceRef,
    pub input_buffer: Buffer,
    pub finalizing_segment: Option<Segment>,
    pub finalized_segments: Vec<Segment>,
    pub statistics: Statistics,
    /// True when the branch has never been persisted.
    pub is_new: bool,
}

impl Entry {
    pub fn new(
        key: BranchKey,
        variant: Variant,
        source_ref: SourceRef,
        config: &AnalysisConfig,
    ) -> Self {
        Entry {
            key,
            variant,
            source_ref,
            input_buffer: Buffer::new(config.hot_buffer_capacity, config.cold_buffer_capacity),
            finalizing_segment: None,
            finalized_segments: Vec::new(),
            statistics: Statistics::default(),
            is_new: true,
        }
    }

    /// Applies new verdicts: buffers them, compacts if the cold tier
    /// filled, and enforces retention against `now`.
    pub fn ingest(
        &mut self,
        verdicts: Vec<PositionVerdict>,
        detector: &dyn ChangepointDetector,
        config: &AnalysisConfig,
        now: DateTime<Utc>,
    ) -> ft_common::Result<()> {
        self.input_buffer.insert(verdicts)?;
        if self.input_buffer.should_compact() {
            self.run_compaction(detector)?;
        }
        let dropped = retention::apply(
            &mut self.finalized_segments,
            &mut self.statistics,
            now,
            config.max_finalized_segments,
            config.retention(),
        );
        if dropped.dropped() > 0 {
            debug!(
                branch = %self.key,
                by_age = dropped.dropped_by_age,
                by_count = dropped.dropped_by_count,
                "retention dropped finalized segments"
            );
        }
        Ok(())
    }

    /// Analyzes the full buffer and moves every verdict before the
    /// last changepoint out of it, closing segments as it goes. The
    /// open regime stays buffered behind a finalizing marker.
    fn run_compaction(&mut self, detector: &dyn ChangepointDetector) -> ft_common::Result<()> {
        let segments = self.input_buffer.compact(detector)?;
        let Some((open, closed)) = segments.split_last() else {
            return Ok(());
        };

        if closed.is_empty() {
            // The whole buffer is one regime. On the first compaction
            // there is no marker yet; later ones keep the existing one.
            if self.finalizing_segment.is_none() {
                self.finalizing_segment = Some(open.to_finalizing_marker());
            }
        } else {
            let evicted = self.input_buffer.evict_first(open.verdict_range.start);
            self.statistics.record_evicted(&evicted);

            // The oldest closed span continues the stored finalizing
            // segment, if any; the rest are complete regimes.
            let mut spans = closed.iter();
            if let Some(first) = spans.next() {
                let finalized = match self.finalizing_segment.take() {
                    Some(finalizing) => first.close_into(finalizing),
                    None => first.to_finalized(),
                };
                self.finalized_segments.push(finalized);
            }
            for span in spans {
                self.finalized_segments.push(span.to_finalized());
            }
            self.finalizing_segment = Some(open.to_finalizing_marker());
        }

        self.relieve_capacity_pressure();
        Ok(())
    }

    /// If the open regime alone still fills the cold tier, evict its
    /// oldest half into the finalizing segment's counts so the buffer
    /// can accept new verdicts.
    fn relieve_capacity_pressure(&mut self) {
        if self.input_buffer.cold.len() < self.input_buffer.cold_capacity {
            return;
        }
        let evicted = self.input_buffer.evict_first(self.input_buffer.cold_capacity / 2);
        if evicted.is_empty() {
            return;
        }
        debug!(
            branch = %self.key,
            evicted = evicted.len(),
            "buffer still full after compaction, evicting into open segment"
        );
        self.statistics.record_evicted(&evicted);
        if let Some(finalizing) = &mut self.finalizing_segment {
            for verdict in &evicted {
                finalizing.finalized_counts.record_verdict(verdict);
            }
            finalizing.observe_unexpected_hour(latest_unexpected_hour(&evicted));
        }
    }

    /// Segmentation of the current buffer contents, for export.
    pub fn buffer_segments(&self, detector: &dyn ChangepointDetector) -> Vec<BufferSegment> {
        let view = self.input_buffer.merged_view();
        let changepoints = detector.analyze(&view);
        segmentize(&view, &changepoints)
    }

    /// Whether a verdict at `commit_position` arrived too late to be
    /// sequenced. Once a finalizing segment exists, a verdict older
    /// than everything in both buffer tiers may belong to an already
    /// finalized span of history and is dropped.
    pub fn should_discard_out_of_order(&self, commit_position: i64) -> bool {
        if self.finalizing_segment.is_none() {
            return false;
        }
        match self.input_buffer.oldest_positions() {
            (Some(hot_first), Some(cold_first)) => {
                commit_position < hot_first && commit_position < cold_first
            }
            _ => false,
        }
    }

    /// Persisted form. The cold tier is omitted unless it changed, so
    /// unchanged cold blobs are not rewritten.
    pub fn to_record(&self) -> BranchRecord {
        let cold = if self.is_new || self.input_buffer.is_cold_dirty {
            Some(self.input_buffer.cold.clone())
        } else {
            None
        };
        BranchRecord {
            key: self.key.clone(),
            variant: self.variant.clone(),
            source_ref: self.source_ref.clone(),
            hot_capacity: self.input_buffer.hot_capacity,
            cold_capacity: self.input_buffer.cold_capacity,
            hot: self.input_buffer.hot.clone(),
            cold,
            finalizing_segment: self.finalizing_segment.clone(),
            finalized_segments: self.finalized_segments.clone(),
            statistics: self.statistics.clone(),
        }
    }

    /// Rebuilds the live state from a stored record. Records read back
    /// from the store always carry their cold tier.
    pub fn from_record(record: BranchRecord) -> Self {
        Entry {
            key: record.key,
            variant: record.variant,
            source_ref: record.source_ref,
            input_buffer: Buffer {
                hot_capacity: record.hot_capacity,
                cold_capacity: record.cold_capacity,
                hot: record.hot,
                cold: record.cold.unwrap_or_default(),
                is_cold_dirty: false,
            },
            finalizing_segment: record.finalizing_segment,
            finalized_segments: record.finalized_segments,
            statistics: record.statistics,
            is_new: false,
        }
    }
}

/// Stored form of an [`Entry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BranchRecord {
    pub key: BranchKey,
    #[serde(default, skip_serializing_if = "Variant::is_empty")]
    pub variant: Variant,
    pub source_ref: SourceRef,
    pub hot_capacity: usize,
    pub cold_capacity: usize,
    #[serde(default, skip_serializing_if = "History::is_empty")]
    pub hot: History,
    /// `None` means "unchanged since last read"; the store keeps the
    /// previous blob.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cold: Option<History>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalizing_segment: Option<Segment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalized_segments: Vec<Segment>,
    #[serde(default, skip_serializing_if = "Statistics::is_empty")]
    pub statistics: Statistics,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{BayesianChangepointDetector, DetectorConfig};
    use crate::segment::SegmentState;
    use crate::verdict::{ResultCounts, Run, VerdictDetails};
    use chrono::TimeZone;

    fn hour(h: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(h * 3600, 0).unwrap()
    }

    fn pass(position: i64) -> PositionVerdict {
        PositionVerdict::simple_pass(position, hour(position))
    }

    fn fail(position: i64) -> PositionVerdict {
        PositionVerdict::with_details(
            position,
            hour(position),
            VerdictDetails {
                is_exonerated: false,
                runs: vec![Run {
                    expected: ResultCounts::default(),
                    unexpected: ResultCounts {
                        fail_count: 1,
                        ..Default::default()
                    },
                }],
            },
        )
    }

    fn source_ref() -> SourceRef {
        SourceRef::gitiles("chromium.googlesource.com", "chromium/src", "refs/heads/main")
    }

    fn branch_key() -> BranchKey {
        BranchKey {
            project: "chromium".into(),
            test_id: "ninja://some/test".into(),
            variant_hash: "8dcc0a7d2e51a768".into(),
            ref_hash: source_ref().ref_hash(),
        }
    }

    fn small_config() -> AnalysisConfig {
        AnalysisConfig {
            hot_buffer_capacity: 5,
            cold_buffer_capacity: 40,
            ..Default::default()
        }
    }

    fn detector() -> BayesianChangepointDetector {
        BayesianChangepointDetector::new(DetectorConfig::default()).unwrap()
    }

    fn new_entry(config: &AnalysisConfig) -> Entry {
        Entry::new(branch_key(), Variant::default(), source_ref(), config)
    }

    #[test]
    fn ingest_buffers_without_compaction() {
        let config = small_config();
        let mut entry = new_entry(&config);
        entry
            .ingest(vec![pass(1), pass(2)], &detector(), &config, hour(2))
            .unwrap();
        assert_eq!(entry.input_buffer.total_len(), 2);
        assert!(entry.finalizing_segment.is_none());
        assert!(entry.finalized_segments.is_empty());
        assert!(entry.statistics.is_empty());
    }

    #[test]
    fn first_compaction_without_changepoint_creates_a_marker() {
        let config = small_config();
        let mut entry = new_entry(&config);
        // Fill past the cold capacity with uniform passes.
        entry
            .ingest((1..=45).map(pass).collect(), &detector(), &config, hour(45))
            .unwrap();

        let finalizing = entry.finalizing_segment.as_ref().unwrap();
        assert_eq!(finalizing.state, SegmentState::Finalizing);
        assert!(!finalizing.has_start_changepoint);
        assert_eq!(finalizing.start_position, 1);
        assert_eq!(finalizing.start_position_lower_bound_99, None);
        assert!(entry.finalized_segments.is_empty());
        // Capacity pressure: the oldest half of the cold tier moved
        // into the marker's counts.
        assert_eq!(finalizing.finalized_counts.total_verdicts, 20);
        assert_eq!(entry.statistics.total_verdicts(), 20);
        assert_eq!(entry.input_buffer.cold.len(), 25);
        assert!(entry.input_buffer.hot.is_empty());
    }

    #[test]
    fn compaction_with_changepoint_finalizes_the_closed_regime() {
        let config = AnalysisConfig {
            hot_buffer_capacity: 5,
            cold_buffer_capacity: 400,
            ..Default::default()
        };
        let mut entry = new_entry(&config);
        let mut verdicts: Vec<_> = (1..=100).map(pass).collect();
        verdicts.extend((101..=405).map(fail));
        entry
            .ingest(verdicts, &detector(), &config, hour(405))
            .unwrap();

        assert_eq!(entry.finalized_segments.len(), 1);
        let finalized = &entry.finalized_segments[0];
        assert_eq!(finalized.state, SegmentState::Finalized);
        assert!(!finalized.has_start_changepoint);
        assert_eq!(finalized.start_position, 1);
        assert_eq!(finalized.end_position, Some(100));
        assert_eq!(finalized.finalized_counts.total_verdicts, 100);
        assert_eq!(finalized.most_recent_unexpected_result_hour, None);

        let finalizing = entry.finalizing_segment.as_ref().unwrap();
        assert!(finalizing.has_start_changepoint);
        assert_eq!(finalizing.start_position, 101);
        assert!(finalizing.start_position_lower_bound_99.unwrap() < 101);
        assert!(finalizing.start_position_upper_bound_99.unwrap() >= 101);
        assert!(finalizing.finalized_counts.is_empty());

        // Only the open regime stays buffered.
        assert_eq!(entry.input_buffer.cold.len(), 305);
        assert!(entry.input_buffer.hot.is_empty());
        assert_eq!(entry.statistics.total_verdicts(), 100);
    }

    #[test]
    fn later_compaction_closes_the_finalizing_segment() {
        let config = AnalysisConfig {
            hot_buffer_capacity: 5,
            cold_buffer_capacity: 400,
            ..Default::default()
        };
        let mut entry = new_entry(&config);
        let mut verdicts: Vec<_> = (1..=100).map(pass).collect();
        verdicts.extend((101..=405).map(fail));
        entry
            .ingest(verdicts, &detector(), &config, hour(405))
            .unwrap();
        let open_start = entry.finalizing_segment.as_ref().unwrap().start_position;
        assert_eq!(open_start, 101);

        // The test recovers: a long run of passes arrives and fills
        // the buffer again.
        entry
            .ingest(
                (406..=506).map(pass).collect(),
                &detector(),
                &config,
                hour(506),
            )
            .unwrap();

        assert_eq!(entry.finalized_segments.len(), 2);
        let closed = &entry.finalized_segments[1];
        assert_eq!(closed.state, SegmentState::Finalized);
        // Closed with the identity of the finalizing marker and the
        // end of its buffered tail.
        assert!(closed.has_start_changepoint);
        assert_eq!(closed.start_position, 101);
        assert_eq!(closed.end_position, Some(405));
        assert_eq!(closed.finalized_counts.total_verdicts, 305);
        assert_eq!(
            closed.most_recent_unexpected_result_hour,
            Some(hour(405))
        );

        let open = entry.finalizing_segment.as_ref().unwrap();
        assert!(open.has_start_changepoint);
        assert_eq!(open.start_position, 406);
        // Only the recovered regime stays buffered.
        assert_eq!(entry.input_buffer.cold.len(), 101);
    }

    #[test]
    fn out_of_order_guard_cases() {
        let config = small_config();
        let position = 10;

        // No finalizing segment: nothing can be out of order.
        let mut entry = new_entry(&config);
        entry.input_buffer.insert(vec![pass(11), pass(15)]).unwrap();
        assert!(!entry.should_discard_out_of_order(position));

        let with_tiers = |hot: &[i64], cold: &[i64]| {
            let mut entry = new_entry(&config);
            entry.finalizing_segment = Some(Segment {
                state: SegmentState::Finalizing,
                has_start_changepoint: false,
                start_position: 1,
                start_hour: hour(1),
                start_position_lower_bound_99: None,
                start_position_upper_bound_99: None,
                end_position: None,
                end_hour: None,
                most_recent_unexpected_result_hour: None,
                finalized_counts: Default::default(),
            });
            for &p in hot {
                entry.input_buffer.hot.verdicts.push(pass(p));
            }
            for &p in cold {
                entry.input_buffer.cold.verdicts.push(pass(p));
            }
            entry
        };

        assert!(!with_tiers(&[1], &[]).should_discard_out_of_order(position));
        assert!(!with_tiers(&[], &[1]).should_discard_out_of_order(position));
        assert!(!with_tiers(&[8, 13], &[7, 9]).should_discard_out_of_order(position));
        assert!(!with_tiers(&[11, 15], &[6, 8]).should_discard_out_of_order(position));
        assert!(!with_tiers(&[11, 15], &[10, 16]).should_discard_out_of_order(position));
        assert!(with_tiers(&[11, 15], &[12, 16]).should_discard_out_of_order(position));
    }

    #[test]
    fn record_round_trip() {
        let config = small_config();
        let mut entry = new_entry(&config);
        let mut verdicts: Vec<_> = (1..=30).map(pass).collect();
        verdicts.push(fail(31));
        entry
            .ingest(verdicts, &detector(), &config, hour(31))
            .unwrap();

        let record = entry.to_record();
        assert!(record.cold.is_some());
        let json = serde_json::to_vec(&record).unwrap();
        let decoded: BranchRecord = serde_json::from_slice(&json).unwrap();
        let restored = Entry::from_record(decoded);

        assert!(!restored.is_new);
        assert!(!restored.input_buffer.is_cold_dirty);
        assert_eq!(restored.key, entry.key);
        assert_eq!(restored.input_buffer.hot, entry.input_buffer.hot);
        assert_eq!(restored.input_buffer.cold, entry.input_buffer.cold);
        assert_eq!(restored.finalizing_segment, entry.finalizing_segment);
        assert_eq!(restored.finalized_segments, entry.finalized_segments);
        assert_eq!(restored.statistics, entry.statistics);
    }

    #[test]
    fn clean_cold_tier_is_omitted_from_the_record() {
        let config = small_config();
        let mut entry = new_entry(&config);
        entry
            .ingest(vec![pass(1)], &detector(), &config, hour(1))
            .unwrap();
        // New entries always write their cold tier.
        assert!(entry.to_record().cold.is_some());

        let mut loaded = Entry::from_record(entry.to_record());
        loaded
            .ingest(vec![pass(2)], &detector(), &config, hour(2))
            .unwrap();
        // Only the hot tier changed.
        assert!(loaded.to_record().cold.is_none());
    }
}
