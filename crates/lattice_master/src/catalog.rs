//! Catalog data model: tables, shards, and index visibility states.
//!
//! Persisted records are plain serde structs (`SysTableRecord`,
//! `SysShardRecord`); the in-memory `TableInfo`/`ShardInfo` wrappers add the
//! copy-on-write locking discipline the controller relies on: a writer
//! mutates a dirty copy, persists it through the sys catalog, and only then
//! commits it as the visible state. Dropping a guard without committing
//! abandons the mutation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

pub type TableId = u64;
pub type IndexId = u64;
pub type ShardId = u64;

/// Visibility state of a secondary index to concurrent readers and writers.
///
/// Writers on the base table maintain the index with strictly increasing
/// capability along the forward path: first delete-marker writes, then full
/// writes, and only after the historical tail is backfilled may reads consult
/// the index. The `*WhileRemoving` states walk the same ladder in reverse for
/// a failing or dropped index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexPermission {
    DeleteOnly,
    WriteAndDelete,
    DoBackfill,
    ReadWriteAndDelete,
    WriteAndDeleteWhileRemoving,
    DeleteOnlyWhileRemoving,
    IndexUnused,
    NotUsed,
}

/// Next state along the permission ladder.
///
/// `DoBackfill` is only left through backfill success or abort, and the
/// steady states have no successor; asking for one is a programming error.
pub fn next_permission(perm: IndexPermission) -> IndexPermission {
    match perm {
        IndexPermission::DeleteOnly => IndexPermission::WriteAndDelete,
        IndexPermission::WriteAndDelete => IndexPermission::DoBackfill,
        IndexPermission::WriteAndDeleteWhileRemoving => IndexPermission::DeleteOnlyWhileRemoving,
        IndexPermission::DeleteOnlyWhileRemoving => IndexPermission::IndexUnused,
        IndexPermission::DoBackfill
        | IndexPermission::ReadWriteAndDelete
        | IndexPermission::IndexUnused
        | IndexPermission::NotUsed => {
            panic!("no next permission from {perm:?}")
        }
    }
}

/// Whether an index in this state still needs the alter-table driver to act.
/// Only `ReadWriteAndDelete` and `NotUsed` are states an index can stay in.
pub fn is_transient(perm: IndexPermission) -> bool {
    !matches!(
        perm,
        IndexPermission::ReadWriteAndDelete | IndexPermission::NotUsed
    )
}

/// Schema-level properties the backfill controller owns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableProperties {
    /// Read timestamp elected for an in-flight backfill of this base table.
    /// Immutable for the life of the job once set; erased on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backfilling_timestamp: Option<u64>,
    /// On an index table: delete markers must not be compacted away while
    /// this is set, because the backfill may still produce an entry an
    /// existing tombstone has to override.
    #[serde(default)]
    pub is_backfilling: bool,
}

/// Table schema. Column payload is opaque to the controller; shard leaders
/// interpret it when scanning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<String>,
    #[serde(default)]
    pub properties: TableProperties,
}

/// Descriptor of one secondary index attached to a base table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    /// Identity of the table holding the index rows.
    pub index_table_id: TableId,
    pub index_name: String,
    pub permission: IndexPermission,
    pub key_columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableState {
    Running,
    Altering,
}

/// Persisted catalog row for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysTableRecord {
    pub table_id: TableId,
    pub table_name: String,
    /// Monotonically increasing schema version; bumped by every committed
    /// alter step.
    pub version: u64,
    pub state: TableState,
    pub schema: TableSchema,
    /// Attached indexes in declaration order.
    pub indexes: Vec<IndexDescriptor>,
    /// Snapshot of the schema as of the last fully propagated version, kept
    /// while an alter is in flight so readers on old shard replicas can still
    /// be served.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fully_applied_schema: Option<TableSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fully_applied_schema_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fully_applied_indexes: Option<Vec<IndexDescriptor>>,
}

impl SysTableRecord {
    pub fn index(&self, index_table_id: TableId) -> Option<&IndexDescriptor> {
        self.indexes
            .iter()
            .find(|idx| idx.index_table_id == index_table_id)
    }

    /// Pin the current schema, version, and index list as fully applied.
    pub fn snapshot_fully_applied(&mut self) {
        self.fully_applied_schema = Some(self.schema.clone());
        self.fully_applied_schema_version = Some(self.version);
        self.fully_applied_indexes = Some(self.indexes.clone());
    }

    pub fn clear_fully_applied(&mut self) {
        self.fully_applied_schema = None;
        self.fully_applied_schema_version = None;
        self.fully_applied_indexes = None;
    }
}

/// Persisted catalog row for one shard of a table.
///
/// `backfilled_until[index]` is the resume cursor for an in-flight backfill:
/// absent means the shard has not started, a non-empty key is the next row to
/// scan, and present-but-empty means the shard finished. The whole map is
/// erased when the job reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysShardRecord {
    pub shard_id: ShardId,
    pub table_id: TableId,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    #[serde(default)]
    pub backfilled_until: BTreeMap<IndexId, Vec<u8>>,
}

/// In-memory handle to one table row.
///
/// The committed record is behind an `RwLock<Arc<..>>`: readers clone the
/// `Arc`, writers stage a dirty copy through [`TableInfo::begin_write`] and
/// swap it in with [`TableWriteGuard::commit`] only after the persist
/// succeeded. The `backfilling` flag is in-memory only and gates the
/// single-builder invariant: at most one backfill job per base table.
pub struct TableInfo {
    table_id: TableId,
    committed: RwLock<Arc<SysTableRecord>>,
    backfilling: AtomicBool,
}

impl TableInfo {
    pub fn new(record: SysTableRecord) -> Arc<Self> {
        Arc::new(Self {
            table_id: record.table_id,
            committed: RwLock::new(Arc::new(record)),
            backfilling: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> TableId {
        self.table_id
    }

    /// Committed snapshot of the record.
    pub fn snapshot(&self) -> Arc<SysTableRecord> {
        self.committed.read().unwrap().clone()
    }

    pub fn version(&self) -> u64 {
        self.committed.read().unwrap().version
    }

    /// Stage a mutation. The write lock is held until the guard commits or
    /// drops; never hold it across an RPC or a sleep.
    pub fn begin_write(&self) -> TableWriteGuard<'_> {
        let slot = self.committed.write().unwrap();
        let dirty = (**slot).clone();
        TableWriteGuard { slot, dirty }
    }

    pub fn is_backfilling(&self) -> bool {
        self.backfilling.load(Ordering::Acquire)
    }

    /// Claim the single-builder slot. Returns false if a backfill is already
    /// in progress.
    pub fn try_begin_backfill(&self) -> bool {
        self.backfilling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_backfill(&self) {
        self.backfilling.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for TableInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rec = self.snapshot();
        f.debug_struct("TableInfo")
            .field("table_id", &rec.table_id)
            .field("name", &rec.table_name)
            .field("version", &rec.version)
            .finish()
    }
}

/// Staged table mutation; see [`TableInfo::begin_write`].
pub struct TableWriteGuard<'a> {
    slot: RwLockWriteGuard<'a, Arc<SysTableRecord>>,
    pub dirty: SysTableRecord,
}

impl TableWriteGuard<'_> {
    /// Publish the dirty record as the committed state.
    pub fn commit(self) {
        let Self { mut slot, dirty } = self;
        *slot = Arc::new(dirty);
    }
}

/// In-memory handle to one shard row; same discipline as [`TableInfo`].
pub struct ShardInfo {
    shard_id: ShardId,
    committed: RwLock<Arc<SysShardRecord>>,
}

impl ShardInfo {
    pub fn new(record: SysShardRecord) -> Arc<Self> {
        Arc::new(Self {
            shard_id: record.shard_id,
            committed: RwLock::new(Arc::new(record)),
        })
    }

    pub fn id(&self) -> ShardId {
        self.shard_id
    }

    pub fn snapshot(&self) -> Arc<SysShardRecord> {
        self.committed.read().unwrap().clone()
    }

    pub fn start_mutation(&self) -> ShardMutation<'_> {
        let slot = self.committed.write().unwrap();
        let dirty = (**slot).clone();
        ShardMutation { slot, dirty }
    }
}

impl std::fmt::Debug for ShardInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardInfo")
            .field("shard_id", &self.shard_id)
            .finish()
    }
}

/// Staged shard mutation; see [`ShardInfo::start_mutation`].
pub struct ShardMutation<'a> {
    slot: RwLockWriteGuard<'a, Arc<SysShardRecord>>,
    pub dirty: SysShardRecord,
}

impl ShardMutation<'_> {
    pub fn commit(self) {
        let Self { mut slot, dirty } = self;
        *slot = Arc::new(dirty);
    }
}
