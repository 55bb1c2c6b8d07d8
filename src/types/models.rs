//! Rows and write models shared by storage and the processing pipeline.

use crate::utils::error::BeaconIndexerError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

/// Canonical-chain status of one `(slot, block_root)` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    /// The block is on the canonical chain.
    Proposed,
    /// The block was replaced by another block for the same slot.
    Forked,
    /// No block was produced for the slot.
    Skipped,
}

impl SlotStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Proposed => "proposed",
            SlotStatus::Forked => "forked",
            SlotStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SlotStatus {
    type Err = BeaconIndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proposed" => Ok(SlotStatus::Proposed),
            "forked" => Ok(SlotStatus::Forked),
            "skipped" => Ok(SlotStatus::Skipped),
            other => Err(BeaconIndexerError::InternalError(format!(
                "unknown slot status '{other}'"
            ))),
        }
    }
}

/// One row of the `slots` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRecord {
    pub epoch: u64,
    pub slot: u64,
    /// Empty for skipped slots.
    pub block_root: String,
    pub state_root: String,
    pub status: SlotStatus,
}

/// One row of the `signed_beacon_block` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBlockRecord {
    pub slot: u64,
    pub block_root: String,
    pub parent_block_root: String,
    pub eth1_block_hash: String,
    pub content_key: String,
}

/// One row of the `beacon_state` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconStateRecord {
    pub slot: u64,
    pub state_root: String,
    pub content_key: String,
}

/// Everything needed to persist one processed slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotWriteModel {
    pub slot: u64,
    pub epoch: u64,
    pub status: SlotStatus,
    pub block_root: String,
    pub state_root: String,
    pub parent_block_root: String,
    pub eth1_block_hash: String,
    pub block_content_key: String,
    pub state_content_key: String,
    pub block_ssz: Bytes,
    pub state_ssz: Bytes,
}

impl SlotWriteModel {
    /// A slot the node has no block for.
    #[must_use]
    pub fn skipped(slot: u64, slots_per_epoch: u64) -> Self {
        Self {
            slot,
            epoch: slot / slots_per_epoch,
            status: SlotStatus::Skipped,
            block_root: String::new(),
            state_root: String::new(),
            parent_block_root: String::new(),
            eth1_block_hash: String::new(),
            block_content_key: String::new(),
            state_content_key: String::new(),
            block_ssz: Bytes::new(),
            state_ssz: Bytes::new(),
        }
    }

    #[must_use]
    pub fn is_skipped(&self) -> bool {
        self.status == SlotStatus::Skipped
    }

    #[must_use]
    pub fn slot_record(&self) -> SlotRecord {
        SlotRecord {
            epoch: self.epoch,
            slot: self.slot,
            block_root: self.block_root.clone(),
            state_root: self.state_root.clone(),
            status: self.status,
        }
    }

    #[must_use]
    pub fn block_record(&self) -> SignedBlockRecord {
        SignedBlockRecord {
            slot: self.slot,
            block_root: self.block_root.clone(),
            parent_block_root: self.parent_block_root.clone(),
            eth1_block_hash: self.eth1_block_hash.clone(),
            content_key: self.block_content_key.clone(),
        }
    }

    #[must_use]
    pub fn state_record(&self) -> BeaconStateRecord {
        BeaconStateRecord {
            slot: self.slot,
            state_root: self.state_root.clone(),
            content_key: self.state_content_key.clone(),
        }
    }
}

/// Result of reconciling the rows of one slot against a canonical root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReorgOutcome {
    /// Rows marked `forked`.
    pub forked: u64,
    /// Rows marked `proposed` (the canonical root).
    pub proposed: u64,
    /// `proposed` rows for the slot after the update.
    pub proposed_total: u64,
}

impl ReorgOutcome {
    /// Reconciliation left the slot without exactly one proposed row.
    #[must_use]
    pub fn is_anomalous(&self) -> bool {
        self.proposed == 0 || self.proposed_total != 1
    }
}

/// The two range queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GapQueue {
    Historic,
    KnownGaps,
}

impl GapQueue {
    /// Backing table.
    #[must_use]
    pub fn table(&self) -> &'static str {
        match self {
            GapQueue::Historic => "historic_process",
            GapQueue::KnownGaps => "known_gaps",
        }
    }

    /// Short name used in logs and errors.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            GapQueue::Historic => "historic",
            GapQueue::KnownGaps => "known_gaps",
        }
    }
}

impl fmt::Display for GapQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A row of either queue table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapRange {
    pub id: i64,
    pub start_slot: u64,
    pub end_slot: u64,
    pub checked_out: bool,
    pub checked_out_by: Option<String>,
    pub checked_out_at: Option<DateTime<Utc>>,
    /// Historic queue only.
    pub priority: Option<i64>,
    /// Known-gaps queue only.
    pub entry_error: Option<String>,
    pub entry_process: Option<String>,
    pub reprocessing_error: Option<String>,
}

impl GapRange {
    /// Bare range, mainly for tests and seeding.
    #[must_use]
    pub fn new(id: i64, start_slot: u64, end_slot: u64) -> Self {
        Self {
            id,
            start_slot,
            end_slot,
            checked_out: false,
            checked_out_by: None,
            checked_out_at: None,
            priority: None,
            entry_error: None,
            entry_process: None,
            reprocessing_error: None,
        }
    }

    /// `start_slot > end_slot`.
    #[must_use]
    pub fn is_reversed(&self) -> bool {
        self.start_slot > self.end_slot
    }

    #[must_use]
    pub fn is_single_slot(&self) -> bool {
        self.start_slot == self.end_slot
    }

    /// Slots covered, empty when reversed.
    #[must_use]
    pub fn slots(&self) -> RangeInclusive<u64> {
        self.start_slot..=self.end_slot
    }

    /// Number of slots covered, zero when reversed.
    #[must_use]
    pub fn len(&self) -> u64 {
        if self.is_reversed() {
            0
        } else {
            self.end_slot - self.start_slot + 1
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Insert model for the known-gaps queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewKnownGap {
    pub start_slot: u64,
    pub end_slot: u64,
    pub entry_error: String,
    pub entry_process: String,
}

/// A failure routed from a slot worker to a queue's error sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingError {
    pub start_slot: u64,
    pub end_slot: u64,
    pub message: String,
}

impl ProcessingError {
    #[must_use]
    pub fn slot(slot: u64, message: impl Into<String>) -> Self {
        Self {
            start_slot: slot,
            end_slot: slot,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_single_slot(&self) -> bool {
        self.start_slot == self.end_slot
    }
}
