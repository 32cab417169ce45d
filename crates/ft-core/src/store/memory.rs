//! In-memory [`AnalysisStore`].
//!
//! Backs tests and single-process deployments. Records are held as
//! serialized JSON so every read and write goes through the same codec
//! a durable backend would use.

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use super::{
    AnalysisStore, BranchTransaction, CheckpointKey, CommitOutcome, Version,
};
use crate::branch::BranchRecord;
use ft_common::{BranchKey, Error};

#[derive(Debug)]
struct StoredBranch {
    bytes: Vec<u8>,
    version: Version,
}

#[derive(Debug, Default)]
struct State {
    branches: BTreeMap<BranchKey, StoredBranch>,
    checkpoints: BTreeSet<String>,
    /// (project, invocation id) to the ingested invocation that
    /// claimed it.
    invocations: BTreeMap<(String, String), String>,
    next_version: u64,
}

/// Thread-safe in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Number of committed batch checkpoints.
    pub fn checkpoint_count(&self) -> usize {
        self.state.lock().unwrap().checkpoints.len()
    }

    /// Number of stored branches.
    pub fn branch_count(&self) -> usize {
        self.state.lock().unwrap().branches.len()
    }

    /// Number of claimed invocations.
    pub fn claim_count(&self) -> usize {
        self.state.lock().unwrap().invocations.len()
    }

    /// Decoded stored record for one branch, if present.
    pub fn fetch_branch(&self, key: &BranchKey) -> Option<BranchRecord> {
        let state = self.state.lock().unwrap();
        let stored = state.branches.get(key)?;
        serde_json::from_slice(&stored.bytes).ok()
    }
}

impl AnalysisStore for MemoryStore {
    fn read_branches(
        &self,
        keys: &[BranchKey],
    ) -> ft_common::Result<Vec<Option<(BranchRecord, Version)>>> {
        let state = self.state.lock().unwrap();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            match state.branches.get(key) {
                Some(stored) => {
                    let record: BranchRecord = serde_json::from_slice(&stored.bytes)?;
                    out.push(Some((record, stored.version)));
                }
                None => out.push(None),
            }
        }
        Ok(out)
    }

    fn is_batch_applied(&self, checkpoint: &CheckpointKey) -> ft_common::Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.checkpoints.contains(&checkpoint.digest()))
    }

    fn claimed_invocations(
        &self,
        project: &str,
        invocation_ids: &[String],
    ) -> ft_common::Result<BTreeMap<String, String>> {
        let state = self.state.lock().unwrap();
        let mut claimed = BTreeMap::new();
        for id in invocation_ids {
            let key = (project.to_string(), id.clone());
            if let Some(owner) = state.invocations.get(&key) {
                claimed.insert(id.clone(), owner.clone());
            }
        }
        Ok(claimed)
    }

    fn commit(&self, txn: BranchTransaction) -> ft_common::Result<CommitOutcome> {
        let mut state = self.state.lock().unwrap();
        if state.checkpoints.contains(&txn.checkpoint.digest()) {
            return Ok(CommitOutcome::AlreadyApplied);
        }

        // Validate every precondition before mutating anything.
        for write in &txn.writes {
            let current = state.branches.get(&write.key).map(|s| s.version);
            if write.expect != current {
                return Err(Error::StoreConflict);
            }
        }

        for write in txn.writes {
            let mut record = write.record;
            if record.cold.is_none() {
                // Unchanged cold tier: keep the previously stored one.
                if let Some(stored) = state.branches.get(&write.key) {
                    let previous: BranchRecord = serde_json::from_slice(&stored.bytes)?;
                    record.cold = previous.cold;
                }
            }
            let bytes = serde_json::to_vec(&record)?;
            state.next_version += 1;
            let version = Version(state.next_version);
            state
                .branches
                .insert(write.key, StoredBranch { bytes, version });
        }

        state.checkpoints.insert(txn.checkpoint.digest());
        for claim in txn.invocation_claims {
            state.invocations.insert(
                (txn.project.clone(), claim.invocation_id),
                claim.ingested_invocation_id,
            );
        }
        Ok(CommitOutcome::Applied {
            commit_time: Utc::now(),
        })
    }
}
