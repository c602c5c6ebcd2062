//! Multi-stage alter-table driver and the index lifecycle manager facade.
//!
//! Index visibility advances one schema version at a time:
//! 1. classify every attached index into advance / delete / backfill buckets
//!    (`plan_alter_step`)
//! 2. apply the highest-priority step under the table's write lock
//!    (advance > delete > backfill > quiesce)
//! 3. broadcast the committed version to shard replicas
//!
//! Each committed version re-enters the driver, so a multi-step transition
//! (DeleteOnly -> WriteAndDelete -> DoBackfill -> backfill -> readable) is a
//! chain of idempotent single steps. A background reconcile pass re-invokes
//! the driver for any table left mid-transition by a crash or leader change.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::backfill_job::{BackfillConfig, BackfillJob};
use crate::catalog::{
    is_transient, next_permission, IndexDescriptor, IndexPermission, ShardInfo, SysShardRecord,
    SysTableRecord, TableId, TableInfo, TableState,
};
use crate::clock::HybridClock;
use crate::error::MasterError;
use crate::shard_tasks::ShardLeaderRpc;
use crate::sys_catalog::SysCatalog;

/// What the alter-table driver should do for one committed table version.
#[derive(Debug, Clone, PartialEq)]
pub enum AlterStep {
    /// Advance these indexes one step along the permission ladder, keyed by
    /// index table id.
    Advance(HashMap<TableId, IndexPermission>),
    /// Physically remove this dead index.
    DeleteIndex(IndexDescriptor),
    /// Start backfilling this index.
    Backfill(IndexDescriptor),
    /// Nothing left to do; clear the altering state.
    Quiesce,
}

/// Classify the table's indexes and pick the next step.
///
/// Advancing wins over deleting, deleting over backfilling: permission moves
/// are cheap metadata commits and unblock writers, while a backfill occupies
/// the table's single builder slot for a long time. Delete and backfill act
/// on the first matching index in declaration order; the rest wait for the
/// next cycle.
pub fn plan_alter_step(record: &SysTableRecord) -> AlterStep {
    let mut to_advance = HashMap::new();
    let mut to_backfill = Vec::new();
    let mut to_delete = Vec::new();

    for index in &record.indexes {
        match index.permission {
            IndexPermission::DoBackfill => to_backfill.push(index),
            IndexPermission::IndexUnused => to_delete.push(index),
            IndexPermission::ReadWriteAndDelete | IndexPermission::NotUsed => {}
            other => {
                to_advance.insert(index.index_table_id, next_permission(other));
            }
        }
    }

    if !to_advance.is_empty() {
        AlterStep::Advance(to_advance)
    } else if let Some(first) = to_delete.first() {
        AlterStep::DeleteIndex((*first).clone())
    } else if let Some(first) = to_backfill.first() {
        AlterStep::Backfill((*first).clone())
    } else {
        AlterStep::Quiesce
    }
}

async fn maybe_slowdown(config: &BackfillConfig) {
    if !config.slowdown_alter_table_rpcs.is_zero() {
        tokio::time::sleep(config.slowdown_alter_table_rpcs).await;
    }
}

/// Rewrite index permissions and commit the next schema version.
///
/// Under the table's write lock: pins the current schema as fully applied,
/// applies `perm_mapping`, bumps the version, flips the table to ALTERING,
/// and persists. With `expected_version` set, a concurrent version move
/// fails the call with `AlreadyPresent` and no side effects; without it the
/// caller owns the transition (backfill success/abort) and commits
/// unconditionally.
pub async fn update_index_permission(
    sys_catalog: &dyn SysCatalog,
    config: &BackfillConfig,
    table: &TableInfo,
    perm_mapping: &HashMap<TableId, IndexPermission>,
    expected_version: Option<u64>,
    leader_term: u64,
) -> Result<(), MasterError> {
    maybe_slowdown(config).await;
    {
        let mut guard = table.begin_write();
        if let Some(expected) = expected_version {
            if guard.dirty.version != expected {
                return Err(MasterError::AlreadyPresent(format!(
                    "schema was already updated to {} before we got to it (expected {})",
                    guard.dirty.version, expected
                )));
            }
        }
        guard.dirty.snapshot_fully_applied();
        for index in &mut guard.dirty.indexes {
            if let Some(new_perm) = perm_mapping.get(&index.index_table_id) {
                index.permission = *new_perm;
            }
        }
        guard.dirty.version += 1;
        guard.dirty.state = TableState::Altering;
        sys_catalog.update_table(&guard.dirty, leader_term)?;
        tracing::info!(
            table_id = guard.dirty.table_id,
            version = guard.dirty.version,
            updates = perm_mapping.len(),
            "committed index permission update"
        );
        guard.commit();
    }
    maybe_slowdown(config).await;
    Ok(())
}

/// Finish an alter: erase the fully-applied snapshot and flip the table back
/// to RUNNING. Fails `AlreadyPresent` when the version moved on, which the
/// caller treats as somebody else having finished the work.
pub fn clear_altering_state(
    sys_catalog: &dyn SysCatalog,
    table: &TableInfo,
    expected_version: u64,
    leader_term: u64,
) -> Result<(), MasterError> {
    let mut guard = table.begin_write();
    if guard.dirty.version != expected_version {
        return Err(MasterError::AlreadyPresent(
            "table has already moved to a different version".to_string(),
        ));
    }
    guard.dirty.clear_fully_applied();
    guard.dirty.state = TableState::Running;
    sys_catalog
        .update_table(&guard.dirty, leader_term)
        .map_err(|err| {
            tracing::warn!(
                table_id = guard.dirty.table_id,
                error = %err,
                "could not persist alter completion; this master may not be the leader anymore"
            );
            err
        })?;
    tracing::info!(
        table_id = guard.dirty.table_id,
        version = expected_version,
        "alter table completed"
    );
    guard.commit();
    Ok(())
}

/// Control-plane facade owning the in-memory catalog, the active backfill
/// jobs, and the seams to the sys catalog, the shard RPC layer, and the
/// cluster clock.
pub struct IndexLifecycleManager {
    /// Back-reference to the owning `Arc`, used to hand jobs a handle
    /// without keeping the manager alive from its own fields.
    self_ref: Weak<IndexLifecycleManager>,
    sys_catalog: Arc<dyn SysCatalog>,
    rpc: Arc<dyn ShardLeaderRpc>,
    clock: Arc<dyn HybridClock>,
    config: BackfillConfig,
    leader_term: AtomicU64,
    tables: RwLock<HashMap<TableId, Arc<TableInfo>>>,
    shards_by_table: RwLock<HashMap<TableId, Vec<Arc<ShardInfo>>>>,
    /// Most recent backfill job per base table, kept after completion for
    /// observability. The single-builder gate is the table's in-memory flag,
    /// not this map.
    jobs: Mutex<HashMap<TableId, Arc<BackfillJob>>>,
}

impl IndexLifecycleManager {
    /// Rebuild the in-memory catalog from the durable image. This is the
    /// leader-start path: everything an interrupted backfill persisted
    /// (timestamps, checkpoints, permission states) comes back through here.
    pub fn load(
        sys_catalog: Arc<dyn SysCatalog>,
        rpc: Arc<dyn ShardLeaderRpc>,
        clock: Arc<dyn HybridClock>,
        config: BackfillConfig,
        leader_term: u64,
    ) -> Result<Arc<Self>, MasterError> {
        let snapshot = sys_catalog.load_all()?;

        let mut tables = HashMap::new();
        for record in snapshot.tables.into_values() {
            tables.insert(record.table_id, TableInfo::new(record));
        }
        let mut shards_by_table: HashMap<TableId, Vec<Arc<ShardInfo>>> = HashMap::new();
        for record in snapshot.shards.into_values() {
            shards_by_table
                .entry(record.table_id)
                .or_default()
                .push(ShardInfo::new(record));
        }
        for shards in shards_by_table.values_mut() {
            shards.sort_by_key(|shard| shard.id());
        }

        Ok(Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            sys_catalog,
            rpc,
            clock,
            config,
            leader_term: AtomicU64::new(leader_term),
            tables: RwLock::new(tables),
            shards_by_table: RwLock::new(shards_by_table),
            jobs: Mutex::new(HashMap::new()),
        }))
    }

    /// Register a new table and its shards, persisting them. Used by the
    /// surrounding create-table / create-index flows.
    pub fn register_table(
        &self,
        record: SysTableRecord,
        shard_records: Vec<SysShardRecord>,
    ) -> Result<Arc<TableInfo>, MasterError> {
        let term = self.leader_term();
        self.sys_catalog.update_table(&record, term)?;
        if !shard_records.is_empty() {
            self.sys_catalog.update_shards(&shard_records, term)?;
        }

        let table_id = record.table_id;
        let info = TableInfo::new(record);
        self.tables
            .write()
            .unwrap()
            .insert(table_id, Arc::clone(&info));
        let mut shards: Vec<Arc<ShardInfo>> =
            shard_records.into_iter().map(ShardInfo::new).collect();
        shards.sort_by_key(|shard| shard.id());
        self.shards_by_table
            .write()
            .unwrap()
            .insert(table_id, shards);
        Ok(info)
    }

    pub fn table(&self, table_id: TableId) -> Option<Arc<TableInfo>> {
        self.tables.read().unwrap().get(&table_id).cloned()
    }

    pub fn tables(&self) -> Vec<Arc<TableInfo>> {
        self.tables.read().unwrap().values().cloned().collect()
    }

    pub fn shards_of(&self, table_id: TableId) -> Vec<Arc<ShardInfo>> {
        self.shards_by_table
            .read()
            .unwrap()
            .get(&table_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn leader_term(&self) -> u64 {
        self.leader_term.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &BackfillConfig {
        &self.config
    }

    pub(crate) fn sys_catalog_arc(&self) -> Arc<dyn SysCatalog> {
        Arc::clone(&self.sys_catalog)
    }

    pub(crate) fn rpc_arc(&self) -> Arc<dyn ShardLeaderRpc> {
        Arc::clone(&self.rpc)
    }

    pub(crate) fn clock_arc(&self) -> Arc<dyn HybridClock> {
        Arc::clone(&self.clock)
    }

    /// Most recent backfill job for the table, if any.
    pub fn get_backfill_job(&self, table_id: TableId) -> Option<Arc<BackfillJob>> {
        self.jobs.lock().unwrap().get(&table_id).cloned()
    }

    /// Entry point invoked after every committed base-table version.
    ///
    /// Idempotent: a stale `expected_version` means another thread already
    /// moved the table forward and the call returns successfully without
    /// side effects.
    pub async fn launch_next_version_if_necessary(
        &self,
        table: &Arc<TableInfo>,
        expected_version: u64,
    ) -> Result<(), MasterError> {
        let record = table.snapshot();
        if record.version != expected_version {
            tracing::warn!(
                table_id = record.table_id,
                expected_version,
                current_version = record.version,
                "somebody launched the next version before we got to it"
            );
            return Ok(());
        }

        match plan_alter_step(&record) {
            AlterStep::Advance(mapping) => {
                match update_index_permission(
                    self.sys_catalog.as_ref(),
                    &self.config,
                    table,
                    &mapping,
                    Some(expected_version),
                    self.leader_term(),
                )
                .await
                {
                    Ok(()) => self.broadcast_alter_table(table),
                    Err(err) => tracing::warn!(
                        table_id = record.table_id,
                        error = %err,
                        "could not update index permissions; possible leader change or a race \
                         with another thread launching the next version"
                    ),
                }
                Ok(())
            }
            AlterStep::DeleteIndex(index) => {
                if let Err(err) = self.delete_index_info(table, index.index_table_id) {
                    tracing::warn!(
                        table_id = record.table_id,
                        index_table_id = index.index_table_id,
                        error = %err,
                        "failed to delete index info"
                    );
                }
                clear_altering_state(
                    self.sys_catalog.as_ref(),
                    table,
                    expected_version,
                    self.leader_term(),
                )
            }
            AlterStep::Backfill(index) => {
                if let Err(err) = self.start_backfill(table, vec![index]).await {
                    if err.is_already_present() {
                        tracing::debug!(
                            table_id = record.table_id,
                            "backfill already in progress"
                        );
                    } else {
                        tracing::warn!(
                            table_id = record.table_id,
                            error = %err,
                            "could not launch backfill"
                        );
                    }
                }
                Ok(())
            }
            AlterStep::Quiesce => clear_altering_state(
                self.sys_catalog.as_ref(),
                table,
                expected_version,
                self.leader_term(),
            ),
        }
    }

    /// Start one backfill job for the table.
    ///
    /// At most one builder per base table: a second caller fails
    /// `AlreadyPresent` without side effects. The fully-applied snapshot is
    /// persisted before the job becomes visible so a crash between the two
    /// leaves a state the reconcile pass can simply re-enter.
    pub async fn start_backfill(
        &self,
        table: &Arc<TableInfo>,
        indexes: Vec<IndexDescriptor>,
    ) -> Result<Arc<BackfillJob>, MasterError> {
        let manager = self.self_ref.upgrade().ok_or_else(|| {
            MasterError::internal("index lifecycle manager is shutting down")
        })?;
        if !table.try_begin_backfill() {
            tracing::warn!(
                table_id = table.id(),
                "not starting backfill, one is already in progress"
            );
            return Err(MasterError::AlreadyPresent(
                "backfill already in progress".to_string(),
            ));
        }

        let persisted: Result<(), MasterError> = {
            let mut guard = table.begin_write();
            guard.dirty.snapshot_fully_applied();
            match self
                .sys_catalog
                .update_table(&guard.dirty, self.leader_term())
            {
                Ok(()) => {
                    guard.commit();
                    Ok(())
                }
                Err(err) => Err(err),
            }
        };
        if let Err(err) = persisted {
            table.end_backfill();
            return Err(err);
        }

        let job = BackfillJob::new(&manager, Arc::clone(table), indexes);
        self.jobs.lock().unwrap().insert(table.id(), Arc::clone(&job));
        tracing::info!(
            table_id = table.id(),
            index = %job.index().index_name,
            "starting index backfill"
        );
        Arc::clone(&job).launch();
        Ok(job)
    }

    /// Remove a dead index's descriptor from its base table.
    fn delete_index_info(
        &self,
        table: &Arc<TableInfo>,
        index_table_id: TableId,
    ) -> Result<(), MasterError> {
        let mut guard = table.begin_write();
        let before = guard.dirty.indexes.len();
        guard
            .dirty
            .indexes
            .retain(|index| index.index_table_id != index_table_id);
        if guard.dirty.indexes.len() == before {
            return Err(MasterError::Incomplete(format!(
                "index {index_table_id} is not attached to table {}",
                guard.dirty.table_id
            )));
        }
        self.sys_catalog
            .update_table(&guard.dirty, self.leader_term())?;
        tracing::info!(
            table_id = guard.dirty.table_id,
            index_table_id,
            "deleted index info"
        );
        guard.commit();
        Ok(())
    }

    pub(crate) fn broadcast_alter_table(&self, table: &Arc<TableInfo>) {
        let rpc = Arc::clone(&self.rpc);
        let record = table.snapshot();
        tokio::spawn(async move {
            rpc.send_alter_table(&record).await;
        });
    }

    /// Background pass re-entering the driver for every table that is mid
    /// alter or has an index in a transient permission. This is what makes a
    /// new leader pick up work an old one abandoned.
    pub fn spawn_reconciler(&self) -> tokio::task::JoinHandle<()> {
        let Some(manager) = self.self_ref.upgrade() else {
            return tokio::spawn(async {});
        };
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.reconcile_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.reconcile_once().await;
            }
        })
    }

    async fn reconcile_once(&self) {
        for table in self.tables() {
            let record = table.snapshot();
            let needs_work = record.state == TableState::Altering
                || record
                    .indexes
                    .iter()
                    .any(|index| is_transient(index.permission));
            if !needs_work {
                continue;
            }
            match self
                .launch_next_version_if_necessary(&table, record.version)
                .await
            {
                Ok(()) => {}
                Err(err) if err.is_already_present() => {}
                Err(err) => {
                    tracing::warn!(
                        table_id = record.table_id,
                        error = %err,
                        "index lifecycle reconcile failed for table"
                    );
                }
            }
        }
    }
}
