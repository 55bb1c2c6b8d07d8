//! Runs against a real database: `DATABASE_URL=... cargo test -- --ignored`.

use beacon_indexer::types::{NewKnownGap, SlotWriteModel};
use beacon_indexer::{GapQueue, SlotStatus, Storage, StorageBackend};

async fn storage() -> Storage {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let storage = Storage::new(&url).await.unwrap();
    storage.initialize().await.unwrap();
    sqlx::query("TRUNCATE slots, blocks, signed_beacon_block, beacon_state, historic_process, known_gaps")
        .execute(storage.pool())
        .await
        .unwrap();
    storage
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_slot_upsert_is_idempotent() {
    let storage = storage().await;
    let model = SlotWriteModel::skipped(64, 32);

    storage.write_slot(&model).await.unwrap();
    storage.write_slot(&model).await.unwrap();

    let rows = storage.get_slots(64).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, SlotStatus::Skipped);
    assert_eq!(rows[0].epoch, 2);
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_lease_is_exclusive_and_released() {
    let storage = storage().await;
    storage.insert_historic(1, 10, 5).await.unwrap();

    let first = storage
        .lease_range(GapQueue::Historic, "worker-a", None)
        .await
        .unwrap();
    let second = storage
        .lease_range(GapQueue::Historic, "worker-b", None)
        .await
        .unwrap();
    assert!(first.is_some());
    assert!(second.is_none());

    assert_eq!(
        storage
            .release_ranges(GapQueue::Historic, "worker-a")
            .await
            .unwrap(),
        1
    );
    let again = storage
        .lease_range(GapQueue::Historic, "worker-b", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.checked_out_by.as_deref(), Some("worker-b"));
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_known_gap_insert_is_deduplicated() {
    let storage = storage().await;
    let gap = NewKnownGap {
        start_slot: 3,
        end_slot: 4,
        entry_error: "timeout".into(),
        entry_process: "head".into(),
    };
    storage.insert_known_gap(&gap).await.unwrap();
    storage.insert_known_gap(&gap).await.unwrap();

    assert_eq!(storage.list_ranges(GapQueue::KnownGaps).await.unwrap().len(), 1);
    assert_eq!(storage.update_reprocessing_error(3, 4, "again").await.unwrap(), 1);
    let row = storage.find_known_gap(3, 4).await.unwrap().unwrap();
    assert_eq!(row.reprocessing_error.as_deref(), Some("again"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires PostgreSQL"]
async fn test_concurrent_leases_never_share_a_range() {
    let storage = std::sync::Arc::new(storage().await);
    for start in (0..5u64).map(|i| i * 10) {
        storage.insert_historic(start, start + 9, 1).await.unwrap();
    }

    let mut tasks = tokio::task::JoinSet::new();
    for worker in 0..12 {
        let storage = storage.clone();
        tasks.spawn(async move {
            storage
                .lease_range(GapQueue::Historic, &format!("worker-{worker}"), None)
                .await
                .unwrap()
        });
    }

    let mut leased = Vec::new();
    while let Some(result) = tasks.join_next().await {
        if let Some(range) = result.unwrap() {
            leased.push(range.id);
        }
    }
    let total = leased.len();
    leased.sort_unstable();
    leased.dedup();
    assert_eq!(total, 5);
    assert_eq!(leased.len(), 5);
}
