//! In-memory storage backend.
//!
//! Mirrors the `PostgreSQL` semantics closely enough to drive the processing
//! pipeline in tests and local runs without a database. A single mutex
//! serializes every operation, which makes each call atomic the same way a
//! database transaction would.

use super::StorageBackend;
use crate::types::{
    BeaconStateRecord, GapQueue, GapRange, NewKnownGap, ReorgOutcome, SignedBlockRecord,
    SlotRecord, SlotStatus, SlotWriteModel,
};
use crate::utils::error::{BeaconIndexerError, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Tables {
    slots: BTreeMap<(u64, String), SlotRecord>,
    blocks: HashMap<String, Vec<u8>>,
    signed_blocks: HashMap<(u64, String), SignedBlockRecord>,
    states: HashMap<(u64, String), BeaconStateRecord>,
    historic: Vec<GapRange>,
    known_gaps: Vec<GapRange>,
    next_id: i64,
}

impl Tables {
    fn queue(&self, queue: GapQueue) -> &Vec<GapRange> {
        match queue {
            GapQueue::Historic => &self.historic,
            GapQueue::KnownGaps => &self.known_gaps,
        }
    }

    fn queue_mut(&mut self, queue: GapQueue) -> &mut Vec<GapRange> {
        match queue {
            GapQueue::Historic => &mut self.historic,
            GapQueue::KnownGaps => &mut self.known_gaps,
        }
    }

    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
struct Faults {
    lease_failures: u32,
    gap_insert_failures: bool,
}

/// In-memory storage backend, cheap to clone.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    tables: Arc<Mutex<Tables>>,
    faults: Arc<Mutex<Faults>>,
}

impl InMemoryStorage {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls to `lease_range` fail.
    pub fn fail_next_leases(&self, count: u32) {
        self.faults.lock().lease_failures = count;
    }

    /// Makes every known-gap insert fail until turned off again.
    pub fn fail_gap_inserts(&self, fail: bool) {
        self.faults.lock().gap_insert_failures = fail;
    }

    /// Total rows in the `slots` table.
    #[must_use]
    pub fn slot_row_count(&self) -> usize {
        self.tables.lock().slots.len()
    }
}

fn injected(what: &str) -> BeaconIndexerError {
    BeaconIndexerError::InternalError(format!("injected {what} failure"))
}

#[async_trait]
impl StorageBackend for InMemoryStorage {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn write_slot(&self, model: &SlotWriteModel) -> Result<()> {
        let mut tables = self.tables.lock();
        tables
            .slots
            .entry((model.slot, model.block_root.clone()))
            .or_insert_with(|| model.slot_record());

        if model.status == SlotStatus::Skipped {
            return Ok(());
        }

        tables
            .blocks
            .entry(model.block_content_key.clone())
            .or_insert_with(|| model.block_ssz.to_vec());
        tables
            .blocks
            .entry(model.state_content_key.clone())
            .or_insert_with(|| model.state_ssz.to_vec());
        tables
            .signed_blocks
            .entry((model.slot, model.block_root.clone()))
            .or_insert_with(|| model.block_record());
        tables
            .states
            .entry((model.slot, model.state_root.clone()))
            .or_insert_with(|| model.state_record());
        Ok(())
    }

    async fn reconcile_slot(&self, slot: u64, canonical_root: &str) -> Result<ReorgOutcome> {
        let mut tables = self.tables.lock();
        let mut outcome = ReorgOutcome::default();

        for ((row_slot, root), record) in &mut tables.slots {
            if *row_slot != slot {
                continue;
            }
            if root == canonical_root {
                record.status = SlotStatus::Proposed;
                outcome.proposed += 1;
            } else {
                record.status = SlotStatus::Forked;
                outcome.forked += 1;
            }
        }
        outcome.proposed_total = tables
            .slots
            .values()
            .filter(|r| r.slot == slot && r.status == SlotStatus::Proposed)
            .count() as u64;

        Ok(outcome)
    }

    async fn get_slots(&self, slot: u64) -> Result<Vec<SlotRecord>> {
        let tables = self.tables.lock();
        Ok(tables
            .slots
            .values()
            .filter(|r| r.slot == slot)
            .cloned()
            .collect())
    }

    async fn get_signed_block(
        &self,
        slot: u64,
        block_root: &str,
    ) -> Result<Option<SignedBlockRecord>> {
        let tables = self.tables.lock();
        Ok(tables
            .signed_blocks
            .get(&(slot, block_root.to_string()))
            .cloned())
    }

    async fn get_beacon_state(
        &self,
        slot: u64,
        state_root: &str,
    ) -> Result<Option<BeaconStateRecord>> {
        let tables = self.tables.lock();
        Ok(tables.states.get(&(slot, state_root.to_string())).cloned())
    }

    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.tables.lock().blocks.get(key).cloned())
    }

    async fn highest_slot(&self) -> Result<Option<u64>> {
        Ok(self.tables.lock().slots.keys().map(|(slot, _)| *slot).max())
    }

    async fn insert_historic(&self, start_slot: u64, end_slot: u64, priority: i64) -> Result<()> {
        let mut tables = self.tables.lock();
        if tables
            .historic
            .iter()
            .any(|r| r.start_slot == start_slot && r.end_slot == end_slot)
        {
            return Ok(());
        }
        let id = tables.next_id();
        let mut range = GapRange::new(id, start_slot, end_slot);
        range.priority = Some(priority);
        tables.historic.push(range);
        Ok(())
    }

    async fn insert_known_gap(&self, gap: &NewKnownGap) -> Result<()> {
        if self.faults.lock().gap_insert_failures {
            return Err(injected("known gap insert"));
        }
        let mut tables = self.tables.lock();
        if tables
            .known_gaps
            .iter()
            .any(|r| r.start_slot == gap.start_slot && r.end_slot == gap.end_slot)
        {
            return Ok(());
        }
        let id = tables.next_id();
        let mut range = GapRange::new(id, gap.start_slot, gap.end_slot);
        range.entry_error = Some(gap.entry_error.clone());
        range.entry_process = Some(gap.entry_process.clone());
        tables.known_gaps.push(range);
        Ok(())
    }

    async fn find_known_gap(&self, start_slot: u64, end_slot: u64) -> Result<Option<GapRange>> {
        Ok(self
            .tables
            .lock()
            .known_gaps
            .iter()
            .find(|r| r.start_slot == start_slot && r.end_slot == end_slot)
            .cloned())
    }

    async fn update_reprocessing_error(
        &self,
        start_slot: u64,
        end_slot: u64,
        error: &str,
    ) -> Result<u64> {
        let mut tables = self.tables.lock();
        let mut updated = 0;
        for range in tables
            .known_gaps
            .iter_mut()
            .filter(|r| r.start_slot == start_slot && r.end_slot == end_slot)
        {
            range.reprocessing_error = Some(error.to_string());
            updated += 1;
        }
        Ok(updated)
    }

    async fn lease_range(
        &self,
        queue: GapQueue,
        worker_id: &str,
        lease_ttl: Option<Duration>,
    ) -> Result<Option<GapRange>> {
        {
            let mut faults = self.faults.lock();
            if faults.lease_failures > 0 {
                faults.lease_failures -= 1;
                return Err(injected("lease"));
            }
        }

        let now = Utc::now();
        let expired_before = match lease_ttl {
            Some(ttl) => Some(
                now - chrono::Duration::from_std(ttl)
                    .map_err(|e| BeaconIndexerError::ConfigError(e.to_string()))?,
            ),
            None => None,
        };

        let mut tables = self.tables.lock();
        let rows = tables.queue_mut(queue);
        let available = |r: &GapRange| {
            let free = !r.checked_out
                || matches!(
                    (expired_before, r.checked_out_at),
                    (Some(cutoff), Some(at)) if at < cutoff
                );
            free && (queue == GapQueue::Historic || !r.is_reversed())
        };

        let candidate = match queue {
            GapQueue::Historic => rows
                .iter_mut()
                .filter(|r| available(r))
                .min_by_key(|r| (r.priority.unwrap_or_default(), r.id)),
            GapQueue::KnownGaps => rows.iter_mut().filter(|r| available(r)).min_by_key(|r| r.id),
        };

        Ok(candidate.map(|range| {
            range.checked_out = true;
            range.checked_out_by = Some(worker_id.to_string());
            range.checked_out_at = Some(now);
            range.clone()
        }))
    }

    async fn delete_range(&self, queue: GapQueue, id: i64) -> Result<u64> {
        let mut tables = self.tables.lock();
        let rows = tables.queue_mut(queue);
        let before = rows.len();
        rows.retain(|r| r.id != id);
        Ok((before - rows.len()) as u64)
    }

    async fn release_ranges(&self, queue: GapQueue, worker_id: &str) -> Result<u64> {
        let mut tables = self.tables.lock();
        let mut released = 0;
        for range in tables
            .queue_mut(queue)
            .iter_mut()
            .filter(|r| r.checked_out_by.as_deref() == Some(worker_id))
        {
            range.checked_out = false;
            range.checked_out_by = None;
            range.checked_out_at = None;
            released += 1;
        }
        Ok(released)
    }

    async fn list_ranges(&self, queue: GapQueue) -> Result<Vec<GapRange>> {
        let tables = self.tables.lock();
        let mut rows = tables.queue(queue).clone();
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn proposed(slot: u64, root: &str) -> SlotWriteModel {
        SlotWriteModel {
            slot,
            epoch: slot / 32,
            status: SlotStatus::Proposed,
            block_root: root.to_string(),
            state_root: format!("{root}-state"),
            parent_block_root: "0xparent".to_string(),
            eth1_block_hash: "0xeth1".to_string(),
            block_content_key: format!("/blocks/{root}"),
            state_content_key: format!("/blocks/{root}-state"),
            block_ssz: Bytes::from_static(b"block"),
            state_ssz: Bytes::from_static(b"state"),
        }
    }

    #[tokio::test]
    async fn test_write_slot_is_idempotent() {
        let storage = InMemoryStorage::new();
        storage.write_slot(&proposed(10, "0xaa")).await.unwrap();
        storage.write_slot(&proposed(10, "0xaa")).await.unwrap();

        assert_eq!(storage.slot_row_count(), 1);
        assert_eq!(
            storage.get_blob("/blocks/0xaa").await.unwrap().as_deref(),
            Some(&b"block"[..])
        );
        assert!(
            storage
                .get_signed_block(10, "0xaa")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_reconcile_marks_other_roots_forked() {
        let storage = InMemoryStorage::new();
        storage.write_slot(&proposed(7, "0xaa")).await.unwrap();
        storage.write_slot(&proposed(7, "0xbb")).await.unwrap();

        let outcome = storage.reconcile_slot(7, "0xbb").await.unwrap();
        assert_eq!(outcome.forked, 1);
        assert_eq!(outcome.proposed, 1);
        assert_eq!(outcome.proposed_total, 1);

        let rows = storage.get_slots(7).await.unwrap();
        let forked: Vec<_> = rows
            .iter()
            .filter(|r| r.status == SlotStatus::Forked)
            .map(|r| r.block_root.as_str())
            .collect();
        assert_eq!(forked, vec!["0xaa"]);
    }

    #[tokio::test]
    async fn test_lease_skips_checked_out_and_reversed() {
        let storage = InMemoryStorage::new();
        for (start, end) in [(20, 10), (1, 5), (6, 9)] {
            storage
                .insert_known_gap(&NewKnownGap {
                    start_slot: start,
                    end_slot: end,
                    entry_error: "e".into(),
                    entry_process: "test".into(),
                })
                .await
                .unwrap();
        }

        let first = storage
            .lease_range(GapQueue::KnownGaps, "a", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!((first.start_slot, first.end_slot), (1, 5));

        let second = storage
            .lease_range(GapQueue::KnownGaps, "b", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!((second.start_slot, second.end_slot), (6, 9));

        assert!(
            storage
                .lease_range(GapQueue::KnownGaps, "c", None)
                .await
                .unwrap()
                .is_none()
        );

        assert_eq!(
            storage
                .release_ranges(GapQueue::KnownGaps, "a")
                .await
                .unwrap(),
            1
        );
        let again = storage
            .lease_range(GapQueue::KnownGaps, "c", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, first.id);
    }

    #[tokio::test]
    async fn test_historic_lease_follows_priority() {
        let storage = InMemoryStorage::new();
        storage.insert_historic(100, 200, 5).await.unwrap();
        storage.insert_historic(0, 99, 1).await.unwrap();
        storage.insert_historic(0, 99, 1).await.unwrap();

        let leased = storage
            .lease_range(GapQueue::Historic, "w", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.start_slot, 0);
        assert_eq!(storage.list_ranges(GapQueue::Historic).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_reclaimed() {
        let storage = InMemoryStorage::new();
        storage.insert_historic(1, 2, 1).await.unwrap();
        storage
            .lease_range(GapQueue::Historic, "dead", None)
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let reclaimed = storage
            .lease_range(GapQueue::Historic, "alive", Some(Duration::from_millis(5)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.checked_out_by.as_deref(), Some("alive"));
    }
}
