//! Identity resolution and history-preserving merge of portal observations.
//!
//! This module holds the pure decision logic shared by every
//! [`PortalStore`](crate::traits::PortalStore) implementation. Stores look up
//! the candidate records for an observation, call [`resolve`], and persist
//! whatever the returned [`MergeDecision`] asks for.
//!
//! Resolution order for one observation:
//!
//! 1. Observation has a guid and a record with that guid exists: merge into it.
//! 2. Otherwise a guid-less record at the exact same coordinates is merged into;
//!    a guid-bearing observation adopts it.
//! 3. A guid-bearing observation whose coordinates are held only by records
//!    with other guids is a conflict.
//! 4. Anything else is an insert.
//!
//! A guid-less observation never matches a guid-bearing record.

use serde::{Deserialize, Serialize};

use crate::models::{Observation, PortalRecord};

/// Records an observation could resolve to.
#[derive(Debug, Default)]
pub struct Candidates<'a> {
    /// The record carrying the observation's guid, if any.
    pub by_guid: Option<&'a PortalRecord>,
    /// All records located at the observation's exact coordinates.
    pub at_location: Vec<&'a PortalRecord>,
}

/// What the store should do with one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeDecision<'a> {
    /// No matching record; create one.
    Insert,
    /// Matching record with a different content key; append to its history.
    Update(&'a PortalRecord),
    /// Matching record with an identical content key; nothing to write.
    Unchanged(&'a PortalRecord),
    /// The observation's coordinates belong to a record with another guid.
    GuidMismatch { existing_guid: String },
}

impl MergeDecision<'_> {
    pub fn outcome(&self) -> MergeOutcome {
        match self {
            MergeDecision::Insert => MergeOutcome::Inserted,
            MergeDecision::Update(_) => MergeOutcome::Modified,
            MergeDecision::Unchanged(_) => MergeOutcome::Unchanged,
            MergeDecision::GuidMismatch { .. } => MergeOutcome::Rejected,
        }
    }
}

/// Resolves an observation against its candidate records.
pub fn resolve<'a>(observation: &Observation, candidates: &Candidates<'a>) -> MergeDecision<'a> {
    let key = observation.content_key();
    let decide = |record: &'a PortalRecord| {
        if record.content_key == key {
            MergeDecision::Unchanged(record)
        } else {
            MergeDecision::Update(record)
        }
    };

    let Some(guid) = observation.guid.as_deref() else {
        return match candidates.at_location.iter().copied().find(|r| r.guid.is_none()) {
            Some(record) => decide(record),
            None => MergeDecision::Insert,
        };
    };

    if let Some(record) = candidates.by_guid {
        return decide(record);
    }

    if let Some(record) = candidates.at_location.iter().copied().find(|r| r.guid.is_none()) {
        return decide(record);
    }

    match candidates
        .at_location
        .iter()
        .filter_map(|r| r.guid.as_deref())
        .find(|existing| *existing != guid)
    {
        Some(existing) => MergeDecision::GuidMismatch {
            existing_guid: existing.to_string(),
        },
        None => MergeDecision::Insert,
    }
}

// =============================================================================
// Outcomes and statistics
// =============================================================================

/// Classification of a single merged observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Modified,
    Unchanged,
    Rejected,
}

/// Why an observation was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    /// The coordinates belong to a record with a different guid.
    GuidMismatch { existing_guid: String },
    /// The observation failed validation.
    InvalidObservation { message: String },
}

/// A skipped observation, identified by its position in the submitted batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRejection {
    pub index: usize,
    pub guid: Option<String>,
    pub reason: RejectionReason,
}

/// Result of merging one batch.
///
/// `upserted` counts every write (`inserted + modified`).
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResult {
    pub inserted: usize,
    pub upserted: usize,
    pub modified: usize,
    pub unchanged: usize,
    pub rejected: Vec<MergeRejection>,
}

impl MergeResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an outcome, incrementing the matching counters.
    ///
    /// Rejections are tracked through [`reject`](Self::reject) instead.
    pub fn record(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Inserted => {
                self.inserted += 1;
                self.upserted += 1;
            }
            MergeOutcome::Modified => {
                self.modified += 1;
                self.upserted += 1;
            }
            MergeOutcome::Unchanged => self.unchanged += 1,
            MergeOutcome::Rejected => {}
        }
    }

    pub fn reject(&mut self, index: usize, guid: Option<String>, reason: RejectionReason) {
        self.rejected.push(MergeRejection {
            index,
            guid,
            reason,
        });
    }

    /// Returns true if at least one record was written.
    pub fn has_changes(&self) -> bool {
        self.upserted > 0
    }

    /// Total number of observations accounted for.
    pub fn total(&self) -> usize {
        self.inserted + self.modified + self.unchanged + self.rejected.len()
    }

    /// Merges the counters of another result, shifting its rejection indices.
    pub fn absorb(&mut self, other: MergeResult, index_offset: usize) {
        self.inserted += other.inserted;
        self.upserted += other.upserted;
        self.modified += other.modified;
        self.unchanged += other.unchanged;
        self.rejected
            .extend(other.rejected.into_iter().map(|mut r| {
                r.index += index_offset;
                r
            }));
    }
}
