// rust/cleaner-core/src/checkpoint.rs

//! Checkpoint directory classification.
//!
//! Training runs write checkpoints to directories named `step<N>`, where `N`
//! is the training step. Sharded checkpoints converted to a single file set
//! live next to them as `step<N>-unsharded`. `step0` is written before any
//! training happens, so a run holding nothing else has not produced anything
//! worth keeping.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{CleanerError, Result};
use crate::storage::StorageAdapter;

/// Suffix of checkpoint directories holding unsharded checkpoints.
pub const UNSHARDED_SUFFIX: &str = "-unsharded";

static CHECKPOINT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^step(\d+)(-unsharded)?/?$").expect("valid checkpoint regex"));

// Prefix matches: `step5000-final` counts as a checkpoint entry.
static CHECKPOINT_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^step\d+").expect("valid checkpoint prefix regex"));

static NONTRIVIAL_CHECKPOINT_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^step[1-9]\d*").expect("valid checkpoint prefix regex"));

/// A checkpoint directory name, parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CheckpointDir {
    pub step: u64,
    pub sharded: bool,
}

impl CheckpointDir {
    /// Parses `step<N>` or `step<N>-unsharded`, with an optional trailing
    /// `/`. Returns `None` for anything else, including step numbers that do
    /// not fit in a `u64`.
    pub fn parse(name: &str) -> Option<Self> {
        let captures = CHECKPOINT_NAME.captures(name)?;
        let step = captures[1].parse().ok()?;
        Some(Self {
            step,
            sharded: captures.get(2).is_none(),
        })
    }

    /// Parses the final segment of a checkpoint path.
    pub fn from_path(path: &str) -> Option<Self> {
        let trimmed = path.trim_end_matches('/');
        let name = trimmed.rsplit('/').next().unwrap_or(trimmed);
        Self::parse(name)
    }
}

/// Name of the directory holding the unsharded form of `name`.
pub fn unsharded_name(name: &str) -> String {
    format!("{}{UNSHARDED_SUFFIX}", name.trim_end_matches('/'))
}

/// Returns true if any entry name starts with `step<N>` (`step0` included).
pub fn contains_checkpoint_dir<S: AsRef<str>>(entries: &[S]) -> bool {
    entries
        .iter()
        .any(|entry| CHECKPOINT_PREFIX.is_match(entry.as_ref()))
}

/// Returns true if any entry name starts with `step<N>` for a step past 0.
pub fn contains_nontrivial_checkpoint_dir<S: AsRef<str>>(entries: &[S]) -> bool {
    entries
        .iter()
        .any(|entry| NONTRIVIAL_CHECKPOINT_PREFIX.is_match(entry.as_ref()))
}

/// Extracts the step number from a checkpoint directory name or path.
///
/// The final path segment must be `step<N>` or `step<N>-unsharded`, with an
/// optional trailing `/`.
pub fn checkpoint_ordinal(name: &str) -> Result<u64> {
    CheckpointDir::from_path(name)
        .map(|checkpoint| checkpoint.step)
        .ok_or_else(|| CleanerError::not_a_checkpoint(name))
}

/// Returns true if `path` names a sharded checkpoint directory that exists.
///
/// The name is checked first so that only plausible candidates cost a
/// storage round trip.
pub async fn is_sharded_checkpoint_dir(adapter: &dyn StorageAdapter, path: &str) -> Result<bool> {
    if !CheckpointDir::from_path(path).is_some_and(|checkpoint| checkpoint.sharded) {
        return Ok(false);
    }
    adapter.is_dir(path).await
}

/// Picks the candidate with the highest step number. Candidates that are not
/// checkpoints are ignored.
pub fn select_latest<S, I>(candidates: I) -> Option<S>
where
    S: AsRef<str>,
    I: IntoIterator<Item = S>,
{
    candidates
        .into_iter()
        .filter_map(|candidate| {
            let step = checkpoint_ordinal(candidate.as_ref()).ok()?;
            Some((step, candidate))
        })
        .max_by_key(|(step, _)| *step)
        .map(|(_, candidate)| candidate)
}
