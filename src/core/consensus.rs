//! Versioned consensus rules.
//!
//! A `ConsensusVersion` is an ordered list of epochs, each carrying the
//! parameters in force over a height range, plus a link to the version it
//! was derived from. Nodes compare versions to decide whether they can
//! peer and, on upgrade, how much of their chain must be re-validated.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::core::params::ConsensusParams;
use crate::core::types::Hash256;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("no epoch covers height {0}")]
    NoEpoch(u64),
    #[error("identical rules already published as version {0}")]
    DuplicateVersion(u32),
    #[error("invalid epochs: {0}")]
    InvalidEpochs(String),
    #[error("unknown consensus version {0}")]
    UnknownVersion(u32),
    #[error("versions {0} and {1} share no common ancestor")]
    NoCommonAncestor(u32, u32),
}

/// Parameters in force over `[start_height, end_height]` (open-ended if `None`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Epoch {
    pub start_height: u64,
    pub end_height: Option<u64>,
    pub params: ConsensusParams,
}

impl Epoch {
    pub fn open(start_height: u64, params: ConsensusParams) -> Self {
        Self { start_height, end_height: None, params }
    }

    pub fn contains(&self, height: u64) -> bool {
        height >= self.start_height && self.end_height.map_or(true, |end| height <= end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForkKind {
    None,
    Soft,
    Hard,
}

#[derive(Debug)]
pub struct ConsensusVersion {
    pub version: u32,
    pub epochs: Vec<Epoch>,
    pub previous: Option<Arc<ConsensusVersion>>,
    pub hash: Hash256,
}

impl ConsensusVersion {
    /// Content hash of an epoch list (blake3 over its bincode encoding)
    pub fn content_hash(epochs: &[Epoch]) -> Hash256 {
        let bytes = bincode::serialize(epochs).expect("epoch serialization failed");
        *blake3::hash(&bytes).as_bytes()
    }

    pub fn consensus_for_height(&self, height: u64) -> Result<&Epoch, ConsensusError> {
        self.epochs
            .iter()
            .find(|e| e.contains(height))
            .ok_or(ConsensusError::NoEpoch(height))
    }

    /// Parameters for a block height; the origin sentinel maps to height 0
    pub fn params_at(&self, height: i64) -> Result<&ConsensusParams, ConsensusError> {
        Ok(&self.consensus_for_height(height.max(0) as u64)?.params)
    }

    /// This version followed by its ancestors, newest first
    pub fn history(&self) -> impl Iterator<Item = &ConsensusVersion> {
        std::iter::successors(Some(self), |v| v.previous.as_deref())
    }

    pub fn find_in_history(&self, version: u32) -> Option<&ConsensusVersion> {
        self.history().find(|v| v.version == version)
    }
}

/// Classify the change from `a` to `b`
pub fn classify_params(a: &ConsensusParams, b: &ConsensusParams) -> ForkKind {
    if a == b {
        return ForkKind::None;
    }
    let hard = b.max_block_size > a.max_block_size
        || a.difficulty_adjustment_interval != b.difficulty_adjustment_interval
        || a.halving_interval != b.halving_interval
        || a.target_block_time != b.target_block_time;
    if hard {
        ForkKind::Hard
    } else {
        ForkKind::Soft
    }
}

/// Compare the epochs in force at `at_height`. A height one of the versions
/// does not cover counts as hard.
pub fn are_compatible(a: &ConsensusVersion, b: &ConsensusVersion, at_height: u64) -> ForkKind {
    if a.hash == b.hash {
        return ForkKind::None;
    }
    match (a.consensus_for_height(at_height), b.consensus_for_height(at_height)) {
        (Ok(ea), Ok(eb)) => classify_params(&ea.params, &eb.params),
        _ => ForkKind::Hard,
    }
}

/// Lowest height at which `a` and `b` may disagree, or `None` if they carry
/// the same epochs.
pub fn divergence_height(a: &ConsensusVersion, b: &ConsensusVersion) -> Result<Option<u64>, ConsensusError> {
    if a.hash == b.hash {
        return Ok(None);
    }
    let common = b
        .history()
        .find(|bv| a.history().any(|av| av.hash == bv.hash))
        .ok_or(ConsensusError::NoCommonAncestor(a.version, b.version))?;

    let lowest = [a, b]
        .into_iter()
        .filter_map(|v| first_new_epoch(v, common))
        .min();
    Ok(lowest)
}

/// Lowest height where `v` and `ancestor` put different parameters in force.
/// Parameters only change at epoch starts, so checking every start of
/// either version finds it.
fn first_new_epoch(v: &ConsensusVersion, ancestor: &ConsensusVersion) -> Option<u64> {
    v.epochs
        .iter()
        .chain(ancestor.epochs.iter())
        .map(|e| e.start_height)
        .filter(|&h| {
            let ours = v.consensus_for_height(h).ok().map(|e| &e.params);
            let theirs = ancestor.consensus_for_height(h).ok().map(|e| &e.params);
            ours != theirs
        })
        .min()
}

/// Contiguous from height 0, non-overlapping, only the last may be open-ended
pub fn validate_epochs(epochs: &[Epoch]) -> Result<(), ConsensusError> {
    let first = epochs
        .first()
        .ok_or_else(|| ConsensusError::InvalidEpochs("no epochs".into()))?;
    if first.start_height != 0 {
        return Err(ConsensusError::InvalidEpochs("first epoch must start at height 0".into()));
    }
    for (i, pair) in epochs.windows(2).enumerate() {
        let end = pair[0].end_height.ok_or_else(|| {
            ConsensusError::InvalidEpochs(format!("epoch {} is open-ended but not last", i))
        })?;
        if end.checked_add(1) != Some(pair[1].start_height) {
            return Err(ConsensusError::InvalidEpochs(format!(
                "epoch {} ends at {} but epoch {} starts at {}",
                i,
                end,
                i + 1,
                pair[1].start_height
            )));
        }
    }
    for (i, epoch) in epochs.iter().enumerate() {
        if matches!(epoch.end_height, Some(end) if end < epoch.start_height) {
            return Err(ConsensusError::InvalidEpochs(format!("epoch {} ends before it starts", i)));
        }
    }
    Ok(())
}

/// Append-only store of published versions. Versions are numbered from 1.
#[derive(Debug, Clone)]
pub struct ConsensusRegistry {
    versions: Vec<Arc<ConsensusVersion>>,
}

/// Flat form of a version for persistence; `previous` is a version number
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version: u32,
    pub epochs: Vec<Epoch>,
    pub previous: Option<u32>,
}

impl ConsensusRegistry {
    /// Registry whose version 1 is a single open epoch with `params`
    pub fn new(params: ConsensusParams) -> Self {
        let epochs = vec![Epoch::open(0, params)];
        let genesis = ConsensusVersion {
            version: 1,
            hash: ConsensusVersion::content_hash(&epochs),
            epochs,
            previous: None,
        };
        Self { versions: vec![Arc::new(genesis)] }
    }

    pub fn publish(
        &mut self,
        epochs: Vec<Epoch>,
        previous: Option<u32>,
    ) -> Result<Arc<ConsensusVersion>, ConsensusError> {
        validate_epochs(&epochs)?;
        let hash = ConsensusVersion::content_hash(&epochs);
        if let Some(existing) = self.versions.iter().find(|v| v.hash == hash) {
            return Err(ConsensusError::DuplicateVersion(existing.version));
        }
        let previous = match previous {
            Some(n) => Some(self.get(n).ok_or(ConsensusError::UnknownVersion(n))?),
            None => None,
        };
        let version = Arc::new(ConsensusVersion {
            version: self.versions.len() as u32 + 1,
            epochs,
            previous,
            hash,
        });
        tracing::info!(
            "📜 Published consensus v{} ({} epochs, derived from {:?})",
            version.version,
            version.epochs.len(),
            version.previous.as_ref().map(|p| p.version),
        );
        self.versions.push(version.clone());
        Ok(version)
    }

    /// Derive a new version from `base` by closing its last epoch at
    /// `from_height - 1` and opening a new one with `params`.
    pub fn publish_upgrade(
        &mut self,
        base: u32,
        from_height: u64,
        params: ConsensusParams,
    ) -> Result<Arc<ConsensusVersion>, ConsensusError> {
        let base_version = self.get(base).ok_or(ConsensusError::UnknownVersion(base))?;
        let mut epochs: Vec<Epoch> = base_version
            .epochs
            .iter()
            .filter(|e| e.start_height < from_height)
            .cloned()
            .collect();
        if let Some(last) = epochs.last_mut() {
            last.end_height = Some(from_height.saturating_sub(1));
        }
        epochs.push(Epoch::open(from_height, params));
        self.publish(epochs, Some(base))
    }

    pub fn get(&self, version: u32) -> Option<Arc<ConsensusVersion>> {
        self.versions.iter().find(|v| v.version == version).cloned()
    }

    pub fn latest(&self) -> Arc<ConsensusVersion> {
        // Never empty: `new` seeds version 1
        self.versions[self.versions.len() - 1].clone()
    }

    pub fn genesis(&self) -> Arc<ConsensusVersion> {
        self.versions[0].clone()
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn to_records(&self) -> Vec<VersionRecord> {
        self.versions
            .iter()
            .map(|v| VersionRecord {
                version: v.version,
                epochs: v.epochs.clone(),
                previous: v.previous.as_ref().map(|p| p.version),
            })
            .collect()
    }

    pub fn from_records(records: &[VersionRecord]) -> Result<Self, ConsensusError> {
        let mut versions: Vec<Arc<ConsensusVersion>> = Vec::with_capacity(records.len());
        for record in records {
            validate_epochs(&record.epochs)?;
            let previous = match record.previous {
                Some(n) => Some(
                    versions
                        .iter()
                        .find(|v| v.version == n)
                        .cloned()
                        .ok_or(ConsensusError::UnknownVersion(n))?,
                ),
                None => None,
            };
            versions.push(Arc::new(ConsensusVersion {
                version: record.version,
                hash: ConsensusVersion::content_hash(&record.epochs),
                epochs: record.epochs.clone(),
                previous,
            }));
        }
        if versions.is_empty() {
            return Err(ConsensusError::InvalidEpochs("registry has no versions".into()));
        }
        Ok(Self { versions })
    }
}
