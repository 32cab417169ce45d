//! Reporting rows for analyzed branches.
//!
//! After every committed batch the pipeline emits one row per updated
//! branch carrying the full segment view: segments still in the input
//! buffer, the finalizing segment merged with its buffered tail, and
//! the finalized segments. Rows are versioned by commit time so
//! downstream consumers can keep the latest row per branch.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::branch::Entry;
use crate::inputbuffer::BufferSegment;
use crate::segment::{merge_unexpected_hour, Counts, Segment};
use ft_common::SourceRef;

/// Destination for branch rows.
pub trait RowSink: Send + Sync {
    fn insert_rows(&self, rows: Vec<BranchRow>) -> ft_common::Result<()>;
}

/// Collects rows in memory, for tests and local runs.
#[derive(Debug, Default)]
pub struct RecordingSink {
    rows: Mutex<Vec<BranchRow>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        RecordingSink::default()
    }

    pub fn rows(&self) -> Vec<BranchRow> {
        self.rows.lock().unwrap().clone()
    }
}

impl RowSink for RecordingSink {
    fn insert_rows(&self, rows: Vec<BranchRow>) -> ft_common::Result<()> {
        self.rows.lock().unwrap().extend(rows);
        Ok(())
    }
}

/// One segment within a branch row, newest first within the row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct SegmentRow {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub has_start_changepoint: bool,
    pub start_position: i64,
    pub start_hour: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_position_lower_bound_99: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_position_upper_bound_99: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_position: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_hour: Option<DateTime<Utc>>,
    pub counts: Counts,
}

impl SegmentRow {
    fn from_buffer(segment: &BufferSegment) -> Self {
        SegmentRow {
            has_start_changepoint: segment.has_start_changepoint,
            start_position: segment.start_position,
            start_hour: segment.start_hour,
            start_position_lower_bound_99: segment.start_position_lower_bound_99,
            start_position_upper_bound_99: segment.start_position_upper_bound_99,
            end_position: Some(segment.end_position),
            end_hour: Some(segment.end_hour),
            counts: segment.counts,
        }
    }

    fn from_stored(segment: &Segment) -> Self {
        SegmentRow {
            has_start_changepoint: segment.has_start_changepoint,
            start_position: segment.start_position,
            start_hour: segment.start_hour,
            start_position_lower_bound_99: segment.start_position_lower_bound_99,
            start_position_upper_bound_99: segment.start_position_upper_bound_99,
            end_position: segment.end_position,
            end_hour: segment.end_hour,
            counts: segment.finalized_counts,
        }
    }
}

/// One exported branch state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct BranchRow {
    pub project: String,
    pub test_id: String,
    pub variant_hash: String,
    pub ref_hash: String,
    /// Variant definition as a JSON object string with sorted keys.
    pub variant: String,
    pub source_ref: SourceRef,
    /// Whether any segment saw an unexpected result recently, relative
    /// to the row version.
    pub has_recent_unexpected_results: bool,
    /// Commit time of the batch that produced this row.
    pub version: DateTime<Utc>,
    /// Random id deduplicating redelivered inserts at the sink.
    pub insert_id: String,
    pub segments: Vec<SegmentRow>,
}

/// Builds the row for one branch.
///
/// Segments are ordered newest first: open segments still in the
/// buffer, then the finalizing segment closed with its buffered tail,
/// then the finalized segments. The oldest buffer segment always
/// continues the stored finalizing segment, so the two merge into one
/// reported segment.
pub fn branch_row(
    entry: &Entry,
    buffer_segments: &[BufferSegment],
    version: DateTime<Utc>,
    recent_window: TimeDelta,
) -> BranchRow {
    let mut segments = Vec::with_capacity(buffer_segments.len() + entry.finalized_segments.len() + 1);
    let mut latest_unexpected = None;

    match (&entry.finalizing_segment, buffer_segments) {
        (Some(finalizing), [oldest, newer @ ..]) => {
            for segment in newer.iter().rev() {
                latest_unexpected = merge_unexpected_hour(
                    latest_unexpected,
                    segment.most_recent_unexpected_result_hour,
                );
                segments.push(SegmentRow::from_buffer(segment));
            }
            let merged = oldest.close_into(finalizing.clone());
            latest_unexpected =
                merge_unexpected_hour(latest_unexpected, merged.most_recent_unexpected_result_hour);
            segments.push(SegmentRow::from_stored(&merged));
        }
        (Some(finalizing), []) => {
            latest_unexpected = merge_unexpected_hour(
                latest_unexpected,
                finalizing.most_recent_unexpected_result_hour,
            );
            segments.push(SegmentRow::from_stored(finalizing));
        }
        (None, buffered) => {
            for segment in buffered.iter().rev() {
                latest_unexpected = merge_unexpected_hour(
                    latest_unexpected,
                    segment.most_recent_unexpected_result_hour,
                );
                segments.push(SegmentRow::from_buffer(segment));
            }
        }
    }
    for segment in entry.finalized_segments.iter().rev() {
        latest_unexpected = merge_unexpected_hour(
            latest_unexpected,
            segment.most_recent_unexpected_result_hour,
        );
        segments.push(SegmentRow::from_stored(segment));
    }

    BranchRow {
        project: entry.key.project.clone(),
        test_id: entry.key.test_id.clone(),
        variant_hash: entry.key.variant_hash.clone(),
        ref_hash: entry.key.ref_hash.to_string(),
        variant: entry.variant.to_json_string(),
        source_ref: entry.source_ref.clone(),
        has_recent_unexpected_results: latest_unexpected
            .is_some_and(|hour| version.signed_duration_since(hour) < recent_window),
        version,
        insert_id: Uuid::new_v4().to_string(),
        segments,
    }
}

/// Hands finished rows to the configured sink.
#[derive(Clone)]
pub struct Exporter {
    sink: Arc<dyn RowSink>,
}

impl Exporter {
    pub fn new(sink: Arc<dyn RowSink>) -> Self {
        Exporter { sink }
    }

    pub fn export(&self, rows: Vec<BranchRow>) -> ft_common::Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.sink.insert_rows(rows)
    }
}
