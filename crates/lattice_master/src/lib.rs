//! LatticeDB control-plane index lifecycle.
//!
//! This crate drives online secondary-index creation for a sharded store:
//! the index-permission state machine, the multi-stage alter-table driver,
//! the per-table backfill job with its safe-time election, and the
//! retry-bearing shard RPC envelopes. The surrounding master process
//! supplies the seams: a [`sys_catalog::SysCatalog`] for leader-term-gated
//! persistence, a [`shard_tasks::ShardLeaderRpc`] transport, and a
//! [`clock::HybridClock`].

pub mod backfill_job;
pub mod catalog;
pub mod clock;
pub mod error;
pub mod index_manager;
pub mod shard_tasks;
pub mod sys_catalog;

pub use backfill_job::{BackfillConfig, BackfillJob};
pub use catalog::{
    is_transient, next_permission, IndexDescriptor, IndexId, IndexPermission, ShardId, ShardInfo,
    SysShardRecord, SysTableRecord, TableId, TableInfo, TableState,
};
pub use clock::{HybridClock, HybridTimestamp, ManualClock, SystemClock};
pub use error::{MasterError, ShardError, ShardErrorCode};
pub use index_manager::{plan_alter_step, AlterStep, IndexLifecycleManager};
pub use shard_tasks::{
    AllowCompactionGcRequest, BackfillChunkRequest, GetSafeTimeRequest, ShardLeaderRpc,
    ShardResponse, TaskState,
};
pub use sys_catalog::{CatalogSnapshot, FileSysCatalog, SysCatalog};
