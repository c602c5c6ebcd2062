//! End-to-end build of one index over three shards: permission ladder,
//! safe-time election, chunked scans, promotion, and checkpoint cleanup.

mod common;

use common::{BASE_SHARDS, BASE_TABLE, INDEX_TABLE};
use lattice_master::{FileSysCatalog, HybridTimestamp, IndexPermission, SysCatalog, TableState, TaskState};

#[tokio::test(flavor = "multi_thread")]
async fn three_shard_backfill_promotes_the_index() {
    let harness = common::new_harness();
    common::seed_tables(&harness, 7, IndexPermission::DeleteOnly);
    let table = harness.manager.table(BASE_TABLE).unwrap();

    // Version 7: delete-only writers become full writers.
    harness
        .manager
        .launch_next_version_if_necessary(&table, 7)
        .await
        .unwrap();
    let record = table.snapshot();
    assert_eq!(record.version, 8);
    assert_eq!(record.state, TableState::Altering);
    assert_eq!(
        record.indexes[0].permission,
        IndexPermission::WriteAndDelete
    );
    assert_eq!(record.fully_applied_schema_version, Some(7));

    // Version 8: writers are full, time to scan the historical tail.
    harness
        .manager
        .launch_next_version_if_necessary(&table, 8)
        .await
        .unwrap();
    let record = table.snapshot();
    assert_eq!(record.version, 9);
    assert_eq!(record.indexes[0].permission, IndexPermission::DoBackfill);

    // Safe times disagree across shards; the election takes the max.
    harness
        .rpc
        .script_safe_time(BASE_SHARDS[0], Ok(HybridTimestamp::from_raw(100)));
    harness
        .rpc
        .script_safe_time(BASE_SHARDS[1], Ok(HybridTimestamp::from_raw(120)));
    harness
        .rpc
        .script_safe_time(BASE_SHARDS[2], Ok(HybridTimestamp::from_raw(115)));
    for shard_id in BASE_SHARDS {
        harness
            .rpc
            .script_chunks(shard_id, vec![Ok(b"k50".to_vec()), Ok(Vec::new())]);
    }

    // Version 9: the backfill job launches.
    harness
        .manager
        .launch_next_version_if_necessary(&table, 9)
        .await
        .unwrap();
    let job = harness.manager.get_backfill_job(BASE_TABLE).unwrap();
    common::wait_for("job completion", || job.state() == TaskState::Complete).await;
    assert_eq!(job.description(), "Backfilling orders_by_status Done");

    // Election: one GetSafeTime per shard, min_cutoff from the cluster clock.
    let safe_time_calls = harness.rpc.safe_time_calls();
    assert_eq!(safe_time_calls.len(), 3);
    assert!(safe_time_calls.iter().all(|(_, cutoff)| *cutoff == 50));
    assert_eq!(job.read_time(), HybridTimestamp::from_raw(120));

    // Every chunk of the job carried the elected timestamp, and each shard
    // resumed from the previously persisted cursor.
    let chunk_calls = harness.rpc.chunk_calls();
    assert_eq!(chunk_calls.len(), 6);
    assert!(chunk_calls.iter().all(|(_, read_time, _)| *read_time == 120));
    for shard_id in BASE_SHARDS {
        let starts: Vec<&Vec<u8>> = chunk_calls
            .iter()
            .filter(|(id, _, _)| *id == shard_id)
            .map(|(_, _, start)| start)
            .collect();
        assert_eq!(starts, vec![&Vec::new(), &b"k50".to_vec()]);
    }

    // Promotion and cleanup: the job is only COMPLETE once the elected
    // timestamp and every shard checkpoint have been erased.
    let record = table.snapshot();
    assert_eq!(record.version, 10);
    assert_eq!(
        record.indexes[0].permission,
        IndexPermission::ReadWriteAndDelete
    );
    assert!(!table.is_backfilling());
    assert!(record.schema.properties.backfilling_timestamp.is_none());
    for shard in harness.manager.shards_of(BASE_TABLE) {
        assert!(shard.snapshot().backfilled_until.is_empty());
    }

    // Delete markers on the index table are released: the persisted flag
    // drops and every index-table shard hears a GC grant.
    common::wait_for("gc fan-out", || harness.rpc.gc_calls().len() == 3).await;
    let mut gc_calls = harness.rpc.gc_calls();
    gc_calls.sort_unstable();
    assert_eq!(gc_calls, common::INDEX_SHARDS.to_vec());
    let index_record = harness.manager.table(INDEX_TABLE).unwrap().snapshot();
    assert!(!index_record.schema.properties.is_backfilling);

    // The durable image agrees with the in-memory state.
    let durable =
        FileSysCatalog::open(harness.dir.path().join("sys_catalog.json")).unwrap();
    let durable_table = durable.find_table(BASE_TABLE).unwrap();
    assert_eq!(
        durable_table.indexes[0].permission,
        IndexPermission::ReadWriteAndDelete
    );
    assert!(durable_table
        .schema
        .properties
        .backfilling_timestamp
        .is_none());
    let snapshot = durable.load_all().unwrap();
    for shard_id in BASE_SHARDS {
        assert!(snapshot.shards[&shard_id].backfilled_until.is_empty());
    }

    // Re-running the driver for an old version is a no-op.
    harness
        .manager
        .launch_next_version_if_necessary(&table, 9)
        .await
        .unwrap();
    assert_eq!(table.snapshot().version, 10);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_base_table_completes_without_chunk_rpcs() {
    let harness = common::new_harness();
    // Base table with no shards at all: the index is promoted straight away
    // once the election picks the clock reading.
    harness
        .manager
        .register_table(common::base_table_record(9, IndexPermission::DoBackfill), Vec::new())
        .unwrap();
    harness
        .manager
        .register_table(common::index_table_record(), Vec::new())
        .unwrap();
    let table = harness.manager.table(BASE_TABLE).unwrap();

    harness
        .manager
        .launch_next_version_if_necessary(&table, 9)
        .await
        .unwrap();
    let job = harness.manager.get_backfill_job(BASE_TABLE).unwrap();
    common::wait_for("job completion", || job.state() == TaskState::Complete).await;

    assert!(harness.rpc.chunk_calls().is_empty());
    assert_eq!(job.read_time(), HybridTimestamp::from_raw(50));
    assert_eq!(
        table.snapshot().indexes[0].permission,
        IndexPermission::ReadWriteAndDelete
    );
}
