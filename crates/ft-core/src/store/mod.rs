//! Branch state persistence.
//!
//! The pipeline reads branch records, mutates them in memory, and
//! commits every branch of a batch in one transaction together with
//! the batch checkpoint and invocation claims. Writes carry the
//! version they read; a version that moved underneath fails the whole
//! transaction with [`ft_common::Error::StoreConflict`] and the
//! pipeline re-reads and retries. A transaction whose checkpoint was
//! already written is a redelivery and commits as a no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::branch::BranchRecord;
use ft_common::BranchKey;

pub mod memory;

pub use memory::MemoryStore;

/// Monotonic per-branch write version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub u64);

/// Identity of one applied batch.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CheckpointKey {
    pub project: String,
    pub ingested_invocation_id: String,
    pub batch_index: usize,
}

impl CheckpointKey {
    /// Stable digest used as the stored checkpoint id.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.project.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.ingested_invocation_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.batch_index.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// One branch mutation within a transaction.
#[derive(Debug, Clone)]
pub struct BranchWrite {
    pub key: BranchKey,
    /// Version the record was read at; `None` asserts the branch does
    /// not exist yet.
    pub expect: Option<Version>,
    pub record: BranchRecord,
}

/// Records that a test result invocation was sequenced under an
/// ingested (top-level) invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationClaim {
    pub invocation_id: String,
    pub ingested_invocation_id: String,
}

/// An atomic batch commit: branch writes, the batch checkpoint, and
/// the invocation claims of the surviving verdicts.
#[derive(Debug, Clone)]
pub struct BranchTransaction {
    pub project: String,
    pub checkpoint: CheckpointKey,
    pub writes: Vec<BranchWrite>,
    pub invocation_claims: Vec<InvocationClaim>,
}

/// Result of a commit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The transaction was applied at `commit_time`.
    Applied { commit_time: DateTime<Utc> },
    /// The checkpoint already existed; nothing was written.
    AlreadyApplied,
}

/// Persistence backend for branch analysis state.
pub trait AnalysisStore: Send + Sync {
    /// Reads the given branches, returning the stored record and its
    /// version for each, in input order.
    fn read_branches(
        &self,
        keys: &[BranchKey],
    ) -> ft_common::Result<Vec<Option<(BranchRecord, Version)>>>;

    /// Whether the batch behind `checkpoint` was already committed.
    fn is_batch_applied(&self, checkpoint: &CheckpointKey) -> ft_common::Result<bool>;

    /// Looks up which ingested invocation claimed each of the given
    /// invocations within `project`. Unclaimed ids are absent from the
    /// returned map.
    fn claimed_invocations(
        &self,
        project: &str,
        invocation_ids: &[String],
    ) -> ft_common::Result<BTreeMap<String, String>>;

    /// Atomically applies a batch transaction.
    fn commit(&self, txn: BranchTransaction) -> ft_common::Result<CommitOutcome>;
}
