//! Ingestion input model.
//!
//! One [`IngestionTask`] carries every test verdict of one ingested
//! (top-level) invocation, together with the sources the verdicts ran
//! against and the presubmit context, if any. The model is what an
//! ingestion front end hands to the pipeline after collecting results
//! from the results service.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use ft_common::{Error, SourceRef, Variant};

static RESULT_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^invocations/([^/]+)/tests/").expect("valid regex"));

/// Extracts the invocation id from a test result resource name of the
/// form `invocations/<id>/tests/...`.
pub fn invocation_from_result_name(name: &str) -> ft_common::Result<&str> {
    let captures = RESULT_NAME_RE
        .captures(name)
        .ok_or_else(|| Error::MalformedResultName {
            name: name.to_string(),
        })?;
    // Capture group 1 always participates in a match.
    Ok(captures.get(1).map(|m| m.as_str()).unwrap_or_default())
}

/// All verdicts of one ingested invocation, ready for analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct IngestionTask {
    pub project: String,
    /// Id of the top-level invocation the verdicts were collected from.
    pub ingested_invocation_id: String,
    pub partition_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presubmit: Option<PresubmitContext>,
    pub verdicts: Vec<TaskVerdict>,
    /// Sources keyed by the id verdicts reference.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sources: BTreeMap<String, Sources>,
}

/// Presubmit run the invocation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PresubmitContext {
    pub status: PresubmitStatus,
    pub mode: PresubmitMode,
}

impl PresubmitContext {
    /// Whether the run's changes made it into the tree: only verdicts
    /// of a succeeded full run describe submitted code.
    pub fn landed(&self) -> bool {
        self.status == PresubmitStatus::Succeeded && self.mode == PresubmitMode::FullRun
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresubmitStatus {
    Succeeded,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresubmitMode {
    FullRun,
    DryRun,
    QuickDryRun,
    NewPatchsetRun,
}

/// Code under test for a set of verdicts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Sources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gitiles: Option<GitilesCommit>,
    /// Set when the checkout had local modifications, so the commit
    /// position does not describe the tested code.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_dirty: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changelists: Vec<Changelist>,
}

impl Sources {
    /// Commit position along the branch, when one is known.
    pub fn commit_position(&self) -> Option<i64> {
        let commit = self.gitiles.as_ref()?;
        (commit.position > 0).then_some(commit.position)
    }

    /// The branch the commit belongs to.
    pub fn source_ref(&self) -> Option<SourceRef> {
        let commit = self.gitiles.as_ref()?;
        Some(SourceRef::gitiles(
            &commit.host,
            &commit.project,
            &commit.ref_name,
        ))
    }
}

/// A commit on a gitiles branch, with its position along the ref.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GitilesCommit {
    pub host: String,
    pub project: String,
    pub ref_name: String,
    pub commit_hash: String,
    /// 1-based position along the ref; 0 when unknown.
    #[serde(default)]
    pub position: i64,
}

/// A changelist applied on top of the checked-out commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Changelist {
    pub host: String,
    pub change: i64,
    pub patchset: i32,
}

/// One test verdict as delivered by the results service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TaskVerdict {
    pub test_id: String,
    pub variant_hash: String,
    #[serde(default, skip_serializing_if = "Variant::is_empty")]
    pub variant: Variant,
    /// Key into [`IngestionTask::sources`].
    pub sources_id: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_exonerated: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<TaskResult>,
}

/// One test result within a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TaskResult {
    /// Resource name: `invocations/<id>/tests/<test>/results/<n>`.
    pub name: String,
    pub status: TestStatus,
    pub expected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Pass,
    Fail,
    Crash,
    Abort,
    Skip,
}
