//! One end-to-end index backfill: safe-time election, per-shard chunked
//! scans, and finalization.
//!
//! A backfill is staged:
//! 1. elect a read snapshot time (`GetSafeTime` fan-out, pointwise max)
//! 2. persist the elected timestamp on the base table
//! 3. drive one resumable chunk loop per shard (`BackfillChunk`)
//! 4. on success, promote the index to `ReadWriteAndDelete`, let the index
//!    table's compactions reclaim delete markers, and erase the checkpoints
//!
//! The elected timestamp and the per-shard `backfilled_until` cursors are
//! persisted before any dependent step runs, which is what makes the whole
//! job resumable: a new master leader rebuilds the job from the catalog and
//! continues where the old one stopped. Persist failures are never surfaced
//! to the user; the operation is abandoned and the next leader's reconcile
//! pass reconstructs it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::catalog::{
    IndexDescriptor, IndexPermission, ShardInfo, TableId, TableInfo, TableState,
};
use crate::clock::{HybridClock, HybridTimestamp};
use crate::error::MasterError;
use crate::index_manager::{update_index_permission, IndexLifecycleManager};
use crate::shard_tasks::{
    run_backfill_chunk, run_get_safe_time, run_shard_task, ShardLeaderRpc, ShardTask,
    ShardTaskKind, TaskState, TaskStateCell,
};
use crate::sys_catalog::SysCatalog;

/// Runtime knobs of the backfill controller. Injected, never global, so
/// tests can vary them without races.
#[derive(Clone, Debug)]
pub struct BackfillConfig {
    /// Per-attempt deadline of every shard RPC.
    pub rpc_timeout: Duration,
    /// Retry ceiling for shard RPCs.
    pub rpc_max_retries: u32,
    /// Cap on exponential backoff between retries.
    pub rpc_max_delay: Duration,
    /// Poll interval while waiting for an in-flight alter on the index table
    /// to finish before delete-marker GC is allowed.
    pub wait_for_alter_table_completion: Duration,
    /// Test-only sleep injected before and after permission updates, so a
    /// master can be stopped between phases.
    pub slowdown_alter_table_rpcs: Duration,
    /// Interval of the background reconcile pass.
    pub reconcile_interval: Duration,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(60),
            rpc_max_retries: 150,
            rpc_max_delay: Duration::from_secs(600),
            wait_for_alter_table_completion: Duration::from_millis(100),
            slowdown_alter_table_rpcs: Duration::ZERO,
            reconcile_interval: Duration::from_secs(1),
        }
    }
}

/// Human-readable job progress, surfaced through the manager's job registry.
fn progress_description(
    index_name: &str,
    state: TaskState,
    timestamp_chosen: bool,
    pending: u64,
    total: u64,
) -> String {
    match state {
        TaskState::Failed => format!("Backfilling {index_name} Failed"),
        TaskState::Aborted => format!("Backfilling {index_name} Aborted"),
        TaskState::Complete => format!("Backfilling {index_name} Done"),
        _ if !timestamp_chosen => {
            format!("Backfilling {index_name}: waiting on safe time from {pending}/{total} shards")
        }
        _ => format!("Backfilling {index_name}: {pending}/{total} shards remaining"),
    }
}

/// One backfill of one index on one base table. Lives only in master memory;
/// everything needed to rebuild it survives in the catalog.
pub struct BackfillJob {
    manager: Weak<IndexLifecycleManager>,
    sys_catalog: Arc<dyn SysCatalog>,
    rpc: Arc<dyn ShardLeaderRpc>,
    clock: Arc<dyn HybridClock>,
    config: BackfillConfig,
    table: Arc<TableInfo>,
    index: IndexDescriptor,
    shards: Vec<Arc<ShardInfo>>,
    /// Schema version the chunk requests carry, captured at job start.
    schema_version: u64,
    /// Leader term captured at job start; a persist rejected under this term
    /// abandons the job.
    leader_term: u64,
    /// Pointwise max of per-shard safe times. Guarded by a mutex because
    /// max-assign is not a single atomic.
    read_time: Mutex<HybridTimestamp>,
    timestamp_chosen: AtomicBool,
    done: AtomicBool,
    num_shards: AtomicU64,
    shards_pending: AtomicU64,
    state: TaskStateCell,
}

impl BackfillJob {
    pub(crate) fn new(
        manager: &Arc<IndexLifecycleManager>,
        table: Arc<TableInfo>,
        mut indexes: Vec<IndexDescriptor>,
    ) -> Arc<Self> {
        // One index per job; every consumer assumes a single entry.
        assert_eq!(indexes.len(), 1, "backfill jobs build exactly one index");
        let index = indexes.pop().expect("asserted non-empty");

        let record = table.snapshot();
        let persisted = record
            .schema
            .properties
            .backfilling_timestamp
            .map(HybridTimestamp::from_raw)
            .filter(|ht| ht.is_valid());
        let (read_time, timestamp_chosen) = match persisted {
            Some(ht) => {
                tracing::info!(
                    table_id = record.table_id,
                    index = %index.index_name,
                    read_time = %ht,
                    "resuming backfill with persisted read time"
                );
                (ht, true)
            }
            None => (HybridTimestamp::INVALID, false),
        };

        let shards = manager.shards_of(record.table_id);
        Arc::new(Self {
            manager: Arc::downgrade(manager),
            sys_catalog: manager.sys_catalog_arc(),
            rpc: manager.rpc_arc(),
            clock: manager.clock_arc(),
            config: manager.config().clone(),
            table,
            index,
            shards,
            schema_version: record.version,
            leader_term: manager.leader_term(),
            read_time: Mutex::new(read_time),
            timestamp_chosen: AtomicBool::new(timestamp_chosen),
            done: AtomicBool::new(false),
            num_shards: AtomicU64::new(0),
            shards_pending: AtomicU64::new(0),
            state: TaskStateCell::new(TaskState::Running),
        })
    }

    pub fn table_id(&self) -> TableId {
        self.table.id()
    }

    pub fn index(&self) -> &IndexDescriptor {
        &self.index
    }

    pub fn state(&self) -> TaskState {
        self.state.load()
    }

    pub fn timestamp_chosen(&self) -> bool {
        self.timestamp_chosen.load(Ordering::Acquire)
    }

    pub fn done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Elected read snapshot time; INVALID until the election completed.
    pub fn read_time(&self) -> HybridTimestamp {
        *self.read_time.lock().unwrap()
    }

    pub fn description(&self) -> String {
        progress_description(
            &self.index.index_name,
            self.state(),
            self.timestamp_chosen(),
            self.shards_pending.load(Ordering::Acquire),
            self.num_shards.load(Ordering::Acquire),
        )
    }

    /// Start the job: elect a read time unless one was already persisted.
    pub(crate) fn launch(self: Arc<Self>) {
        if self.timestamp_chosen() {
            self.launch_backfill();
        } else {
            self.launch_compute_safe_time();
        }
    }

    fn launch_compute_safe_time(self: Arc<Self>) {
        let total = self.shards.len() as u64;
        self.num_shards.store(total, Ordering::Release);
        self.shards_pending.store(total, Ordering::Release);
        let min_cutoff = self.clock.now();

        if self.shards.is_empty() {
            // Nothing constrains the snapshot; elect the clock reading.
            tokio::spawn(async move {
                let mut elected = min_cutoff;
                elected.make_at_least(self.clock.now());
                if let Err(err) = self.finish_safe_time_election(elected) {
                    tracing::warn!(error = %err, "could not persist elected read time");
                }
            });
            return;
        }

        for shard in &self.shards {
            let job = Arc::clone(&self);
            let shard_id = shard.id();
            tokio::spawn(async move {
                let task = ShardTask::new(shard_id, ShardTaskKind::GetSafeTime { min_cutoff });
                let result =
                    run_get_safe_time(&task, job.rpc.as_ref(), job.clock.as_ref(), &job.config)
                        .await;
                if let Err(err) = job.update_safe_time(result).await {
                    tracing::warn!(shard_id, error = %err, "could not update safe time");
                }
            });
        }
    }

    /// Fold one shard's safe-time report into the election.
    ///
    /// The first failure flips `timestamp_chosen` and aborts the job; late
    /// successes and late failures after that are dropped on the floor.
    pub(crate) async fn update_safe_time(
        self: Arc<Self>,
        result: Result<HybridTimestamp, MasterError>,
    ) -> Result<(), MasterError> {
        let safe_time = match result {
            Err(err) => {
                tracing::error!(
                    table_id = self.table.id(),
                    index = %self.index.index_name,
                    error = %err,
                    "failed to compute safe time for backfill"
                );
                if !self.timestamp_chosen.swap(true, Ordering::AcqRel) {
                    self.alter_table_state_to_abort(TaskState::Failed).await?;
                }
                return Ok(());
            }
            Ok(ht) => ht,
        };

        let read_time = {
            let mut guard = self.read_time.lock().unwrap();
            guard.make_at_least(safe_time);
            *guard
        };

        if !self.timestamp_chosen() && self.shards_pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            tracing::info!(
                table_id = self.table.id(),
                index = %self.index.index_name,
                read_time = %read_time,
                "completed safe time election"
            );
            self.finish_safe_time_election(read_time)?;
        }
        Ok(())
    }

    /// Persist the elected timestamp and move to the scan phase. Once this
    /// commits, the read time is immutable for the life of the job.
    fn finish_safe_time_election(self: Arc<Self>, elected: HybridTimestamp) -> Result<(), MasterError> {
        let chosen = {
            let mut guard = self.read_time.lock().unwrap();
            guard.make_at_least(elected);
            *guard
        };
        {
            let mut guard = self.table.begin_write();
            guard.dirty.schema.properties.backfilling_timestamp = Some(chosen.as_raw());
            self.sys_catalog
                .update_table(&guard.dirty, self.leader_term)
                .map_err(|err| {
                    tracing::warn!(error = %err, "failed to persist backfilling timestamp, abandoning");
                    err
                })?;
            guard.commit();
        }
        self.timestamp_chosen.store(true, Ordering::Release);
        self.launch_backfill();
        Ok(())
    }

    fn launch_backfill(self: Arc<Self>) {
        let total = self.shards.len() as u64;
        self.num_shards.store(total, Ordering::Release);
        self.shards_pending.store(total, Ordering::Release);
        tracing::info!(
            table_id = self.table.id(),
            index = %self.index.index_name,
            shards = total,
            read_time = %self.read_time(),
            "launching backfill"
        );

        if self.shards.is_empty() {
            if !self.done.swap(true, Ordering::AcqRel) {
                tokio::spawn(async move {
                    if let Err(err) = self.alter_table_state_to_success().await {
                        tracing::warn!(error = %err, "failed to complete backfill");
                    }
                });
            }
            return;
        }

        for shard in &self.shards {
            let driver = ShardBackfill::new(Arc::clone(&self), Arc::clone(shard));
            tokio::spawn(driver.run());
        }
    }

    /// One shard driver reached a terminal state.
    pub(crate) async fn shard_done(&self, status: Result<(), MasterError>) -> Result<(), MasterError> {
        if let Err(err) = status {
            tracing::error!(
                table_id = self.table.id(),
                index = %self.index.index_name,
                error = %err,
                "failed to backfill the index"
            );
            if !self.done.swap(true, Ordering::AcqRel) {
                self.alter_table_state_to_abort(TaskState::Failed).await?;
            } else {
                tracing::info!("somebody else already aborted the index backfill");
            }
            return Ok(());
        }

        if !self.done() && self.shards_pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.done.store(true, Ordering::Release);
            tracing::info!(
                table_id = self.table.id(),
                index = %self.index.index_name,
                "completed backfilling the index table"
            );
            self.alter_table_state_to_success().await?;
        }
        Ok(())
    }

    /// Cancel the job: drives the index through the removal side of the
    /// permission state machine, exactly like an unrecoverable shard error.
    pub async fn cancel(&self) -> Result<(), MasterError> {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.timestamp_chosen.store(true, Ordering::Release);
            self.alter_table_state_to_abort(TaskState::Aborted).await?;
        }
        Ok(())
    }

    async fn alter_table_state_to_success(&self) -> Result<(), MasterError> {
        let mapping: HashMap<TableId, IndexPermission> = [(
            self.index.index_table_id,
            IndexPermission::ReadWriteAndDelete,
        )]
        .into_iter()
        .collect();
        // The job owns the exclusive transition out of DoBackfill, so no
        // version guard is needed here.
        update_index_permission(
            self.sys_catalog.as_ref(),
            &self.config,
            self.table.as_ref(),
            &mapping,
            None,
            self.leader_term,
        )
        .await?;
        self.broadcast_alter_table();

        self.allow_compactions_to_gc_delete_markers().await?;

        tracing::info!(
            table_id = self.table.id(),
            index = %self.index.index_name,
            "index backfill complete"
        );
        self.table.end_backfill();
        self.clear_checkpoints()?;
        self.state.try_transition(TaskState::Running, TaskState::Complete);
        Ok(())
    }

    async fn alter_table_state_to_abort(&self, terminal: TaskState) -> Result<(), MasterError> {
        let mapping: HashMap<TableId, IndexPermission> = [(
            self.index.index_table_id,
            IndexPermission::WriteAndDeleteWhileRemoving,
        )]
        .into_iter()
        .collect();
        update_index_permission(
            self.sys_catalog.as_ref(),
            &self.config,
            self.table.as_ref(),
            &mapping,
            None,
            self.leader_term,
        )
        .await?;
        self.broadcast_alter_table();
        self.table.end_backfill();
        self.clear_checkpoints()?;
        self.state.try_transition(TaskState::Running, terminal);
        Ok(())
    }

    /// Erase `backfilled_until` on every shard in one batch, then erase the
    /// elected timestamp from the base table.
    fn clear_checkpoints(&self) -> Result<(), MasterError> {
        let mut mutations = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            let mut mutation = shard.start_mutation();
            mutation
                .dirty
                .backfilled_until
                .remove(&self.index.index_table_id);
            mutations.push(mutation);
        }
        let dirty: Vec<_> = mutations.iter().map(|m| m.dirty.clone()).collect();
        self.sys_catalog
            .update_shards(&dirty, self.leader_term)
            .map_err(|err| {
                tracing::warn!(error = %err, "could not persist checkpoint erasure");
                err
            })?;
        for mutation in mutations {
            mutation.commit();
        }

        let mut guard = self.table.begin_write();
        guard.dirty.schema.properties.backfilling_timestamp = None;
        self.sys_catalog
            .update_table(&guard.dirty, self.leader_term)
            .map_err(|err| {
                tracing::warn!(error = %err, "could not clear backfilling timestamp");
                err
            })?;
        guard.commit();
        tracing::debug!(table_id = self.table.id(), "cleared backfilling timestamp");
        Ok(())
    }

    /// Let the index table's compactions reclaim delete markers again.
    ///
    /// While the backfill was running the markers had to be kept: a late
    /// chunk may still produce a live entry an existing tombstone has to
    /// override. Waits out any in-flight alter on the index table first.
    async fn allow_compactions_to_gc_delete_markers(&self) -> Result<(), MasterError> {
        let manager = self.manager.upgrade().ok_or_else(|| {
            MasterError::internal("index lifecycle manager dropped mid-backfill")
        })?;
        let index_table = manager.table(self.index.index_table_id).ok_or_else(|| {
            MasterError::Incomplete(format!(
                "index table {} not found; ok if the index was deleted",
                self.index.index_table_id
            ))
        })?;

        let mut first_run = true;
        loop {
            if !first_run {
                tokio::time::sleep(self.config.wait_for_alter_table_completion).await;
                tracing::info!(
                    index_table_id = index_table.id(),
                    "waiting for the previous alter table to complete on the index table"
                );
            }
            first_run = false;
            if index_table.snapshot().state == TableState::Running {
                break;
            }
        }

        {
            let mut guard = index_table.begin_write();
            guard.dirty.schema.properties.is_backfilling = false;
            self.sys_catalog
                .update_table(&guard.dirty, self.leader_term)?;
            guard.commit();
        }

        for shard in manager.shards_of(index_table.id()) {
            let rpc = self.rpc.clone();
            let clock = self.clock.clone();
            let config = self.config.clone();
            let shard_id = shard.id();
            tokio::spawn(async move {
                let task = ShardTask::new(shard_id, ShardTaskKind::AllowCompactionGc);
                if let Err(err) =
                    run_shard_task(&task, rpc.as_ref(), clock.as_ref(), &config).await
                {
                    tracing::warn!(shard_id, error = %err, "failed to allow delete marker gc");
                }
            });
        }
        Ok(())
    }

    fn broadcast_alter_table(&self) {
        let rpc = self.rpc.clone();
        let record = self.table.snapshot();
        tokio::spawn(async move {
            rpc.send_alter_table(&record).await;
        });
    }
}

/// Resumable chunk loop over one shard of the base table.
struct ShardBackfill {
    job: Arc<BackfillJob>,
    shard: Arc<ShardInfo>,
    next_row_to_backfill: Vec<u8>,
    done: bool,
}

impl ShardBackfill {
    fn new(job: Arc<BackfillJob>, shard: Arc<ShardInfo>) -> Self {
        let record = shard.snapshot();
        let (next_row_to_backfill, done) =
            match record.backfilled_until.get(&job.index.index_table_id) {
                Some(key) if key.is_empty() => (Vec::new(), true),
                Some(key) => (key.clone(), false),
                None => (Vec::new(), false),
            };
        if done {
            tracing::info!(shard_id = shard.id(), "shard backfill already done");
        } else if next_row_to_backfill.is_empty() {
            tracing::debug!(shard_id = shard.id(), "beginning shard backfill from the start");
        } else {
            tracing::info!(
                shard_id = shard.id(),
                resume_key = ?next_row_to_backfill,
                "resuming shard backfill from checkpoint"
            );
        }
        Self {
            job,
            shard,
            next_row_to_backfill,
            done,
        }
    }

    async fn run(mut self) {
        loop {
            if self.done {
                if let Err(err) = self.job.shard_done(Ok(())).await {
                    tracing::warn!(
                        shard_id = self.shard.id(),
                        error = %err,
                        "could not report shard backfill completion"
                    );
                }
                return;
            }

            let task = ShardTask::new(
                self.shard.id(),
                ShardTaskKind::BackfillChunk {
                    read_time: self.job.read_time(),
                    schema_version: self.job.schema_version,
                    start_key: self.next_row_to_backfill.clone(),
                    index: self.job.index.clone(),
                },
            );
            let next_key = match run_backfill_chunk(
                &task,
                self.job.rpc.as_ref(),
                self.job.clock.as_ref(),
                &self.job.config,
            )
            .await
            {
                Ok(next_key) => next_key,
                Err(err) => {
                    tracing::info!(
                        shard_id = self.shard.id(),
                        error = %err,
                        "failed to backfill the shard"
                    );
                    if let Err(report_err) = self.job.shard_done(Err(err)).await {
                        tracing::warn!(
                            shard_id = self.shard.id(),
                            error = %report_err,
                            "could not report shard backfill failure"
                        );
                    }
                    return;
                }
            };

            // The cursor persists before the next chunk is launched so a
            // restart never re-scans or skips a row.
            self.next_row_to_backfill = next_key.clone();
            let mut mutation = self.shard.start_mutation();
            mutation
                .dirty
                .backfilled_until
                .insert(self.job.index.index_table_id, next_key.clone());
            match self
                .job
                .sys_catalog
                .update_shards(&[mutation.dirty.clone()], self.job.leader_term)
            {
                Ok(()) => mutation.commit(),
                Err(err) => {
                    // No longer leader; the incoming leader rebuilds the job
                    // from the persisted checkpoints.
                    tracing::warn!(
                        shard_id = self.shard.id(),
                        error = %err,
                        "could not persist shard checkpoint, abandoning backfill"
                    );
                    return;
                }
            }

            if next_key.is_empty() {
                tracing::info!(shard_id = self.shard.id(), "done backfilling the shard");
                self.done = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_strings_follow_the_job_phases() {
        let desc = progress_description("orders_by_status", TaskState::Running, false, 2, 3);
        assert_eq!(
            desc,
            "Backfilling orders_by_status: waiting on safe time from 2/3 shards"
        );
        let desc = progress_description("orders_by_status", TaskState::Running, true, 1, 3);
        assert_eq!(desc, "Backfilling orders_by_status: 1/3 shards remaining");
        let desc = progress_description("orders_by_status", TaskState::Complete, true, 0, 3);
        assert_eq!(desc, "Backfilling orders_by_status Done");
        let desc = progress_description("orders_by_status", TaskState::Failed, true, 1, 3);
        assert_eq!(desc, "Backfilling orders_by_status Failed");
        let desc = progress_description("orders_by_status", TaskState::Aborted, true, 1, 3);
        assert_eq!(desc, "Backfilling orders_by_status Aborted");
    }

    #[test]
    fn default_config_carries_the_documented_knobs() {
        let config = BackfillConfig::default();
        assert_eq!(config.rpc_timeout, Duration::from_secs(60));
        assert_eq!(config.rpc_max_retries, 150);
        assert_eq!(config.rpc_max_delay, Duration::from_secs(600));
        assert_eq!(
            config.wait_for_alter_table_completion,
            Duration::from_millis(100)
        );
        assert_eq!(config.slowdown_alter_table_rpcs, Duration::ZERO);
    }
}
