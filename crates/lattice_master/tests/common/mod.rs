//! Shared helpers for integration tests: a scripted shard-leader transport
//! that records every request, catalog record builders, and a harness that
//! wires a manager over a temp-dir sys catalog.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lattice_master::shard_tasks::{
    AllowCompactionGcRequest, BackfillChunkRequest, GetSafeTimeRequest, ShardLeaderRpc,
    ShardResponse,
};
use lattice_master::{
    BackfillConfig, FileSysCatalog, HybridTimestamp, IndexDescriptor, IndexLifecycleManager,
    IndexPermission, ManualClock, ShardError, ShardId, SysShardRecord, SysTableRecord, TableId,
    TableState,
};

pub const BASE_TABLE: TableId = 1;
pub const INDEX_TABLE: TableId = 2;
pub const BASE_SHARDS: [ShardId; 3] = [101, 102, 103];
pub const INDEX_SHARDS: [ShardId; 3] = [201, 202, 203];

/// One recorded shard RPC, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcCall {
    GetSafeTime {
        shard_id: ShardId,
        min_cutoff: u64,
    },
    BackfillChunk {
        shard_id: ShardId,
        read_time: u64,
        schema_version: u64,
        start_key: Vec<u8>,
    },
    AllowCompactionGc {
        shard_id: ShardId,
    },
    AlterTable {
        table_id: TableId,
        version: u64,
    },
}

/// One scripted chunk outcome. `Hold` parks the request forever, keeping the
/// shard mid-scan for cancellation tests.
pub enum ChunkReply {
    Reply(Result<Vec<u8>, ShardError>),
    Hold,
}

/// Scripted shard-leader transport. Unscripted shards answer with a safe
/// time of raw 1000 and an immediately exhausted chunk.
pub struct ScriptedShardRpc {
    calls: Mutex<Vec<RpcCall>>,
    safe_times: Mutex<HashMap<ShardId, VecDeque<Result<HybridTimestamp, ShardError>>>>,
    chunks: Mutex<HashMap<ShardId, VecDeque<ChunkReply>>>,
}

impl ScriptedShardRpc {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            safe_times: Mutex::new(HashMap::new()),
            chunks: Mutex::new(HashMap::new()),
        })
    }

    pub fn script_safe_time(&self, shard_id: ShardId, result: Result<HybridTimestamp, ShardError>) {
        self.safe_times
            .lock()
            .unwrap()
            .entry(shard_id)
            .or_default()
            .push_back(result);
    }

    pub fn script_chunks(&self, shard_id: ShardId, results: Vec<Result<Vec<u8>, ShardError>>) {
        self.chunks
            .lock()
            .unwrap()
            .entry(shard_id)
            .or_default()
            .extend(results.into_iter().map(ChunkReply::Reply));
    }

    /// Park every chunk request for this shard until the test ends.
    pub fn hold_chunks(&self, shard_id: ShardId) {
        self.chunks
            .lock()
            .unwrap()
            .entry(shard_id)
            .or_default()
            .push_back(ChunkReply::Hold);
    }

    pub fn calls(&self) -> Vec<RpcCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn safe_time_calls(&self) -> Vec<(ShardId, u64)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RpcCall::GetSafeTime {
                    shard_id,
                    min_cutoff,
                } => Some((shard_id, min_cutoff)),
                _ => None,
            })
            .collect()
    }

    pub fn chunk_calls(&self) -> Vec<(ShardId, u64, Vec<u8>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RpcCall::BackfillChunk {
                    shard_id,
                    read_time,
                    start_key,
                    ..
                } => Some((shard_id, read_time, start_key)),
                _ => None,
            })
            .collect()
    }

    pub fn gc_calls(&self) -> Vec<ShardId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RpcCall::AllowCompactionGc { shard_id } => Some(shard_id),
                _ => None,
            })
            .collect()
    }

    fn propagated() -> HybridTimestamp {
        HybridTimestamp::from_raw(1)
    }
}

#[async_trait]
impl ShardLeaderRpc for ScriptedShardRpc {
    async fn get_safe_time(&self, req: GetSafeTimeRequest) -> ShardResponse<HybridTimestamp> {
        self.calls.lock().unwrap().push(RpcCall::GetSafeTime {
            shard_id: req.shard_id,
            min_cutoff: req.min_cutoff.as_raw(),
        });
        let scripted = self
            .safe_times
            .lock()
            .unwrap()
            .get_mut(&req.shard_id)
            .and_then(VecDeque::pop_front);
        ShardResponse {
            result: scripted.unwrap_or(Ok(HybridTimestamp::from_raw(1000))),
            propagated_hybrid_time: Self::propagated(),
        }
    }

    async fn backfill_chunk(&self, req: BackfillChunkRequest) -> ShardResponse<Vec<u8>> {
        self.calls.lock().unwrap().push(RpcCall::BackfillChunk {
            shard_id: req.shard_id,
            read_time: req.read_time.as_raw(),
            schema_version: req.schema_version,
            start_key: req.start_key.clone(),
        });
        let scripted = self
            .chunks
            .lock()
            .unwrap()
            .get_mut(&req.shard_id)
            .and_then(VecDeque::pop_front);
        let result = match scripted {
            Some(ChunkReply::Reply(result)) => result,
            Some(ChunkReply::Hold) => std::future::pending().await,
            None => Ok(Vec::new()),
        };
        ShardResponse {
            result,
            propagated_hybrid_time: Self::propagated(),
        }
    }

    async fn allow_compaction_gc(&self, req: AllowCompactionGcRequest) -> ShardResponse<()> {
        self.calls.lock().unwrap().push(RpcCall::AllowCompactionGc {
            shard_id: req.shard_id,
        });
        ShardResponse {
            result: Ok(()),
            propagated_hybrid_time: Self::propagated(),
        }
    }

    async fn send_alter_table(&self, table: &SysTableRecord) {
        self.calls.lock().unwrap().push(RpcCall::AlterTable {
            table_id: table.table_id,
            version: table.version,
        });
    }
}

pub fn test_config() -> BackfillConfig {
    BackfillConfig {
        rpc_timeout: Duration::from_secs(5),
        rpc_max_retries: 3,
        rpc_max_delay: Duration::from_millis(5),
        wait_for_alter_table_completion: Duration::from_millis(5),
        slowdown_alter_table_rpcs: Duration::ZERO,
        reconcile_interval: Duration::from_millis(50),
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub sys: Arc<FileSysCatalog>,
    pub rpc: Arc<ScriptedShardRpc>,
    pub clock: Arc<ManualClock>,
    pub manager: Arc<IndexLifecycleManager>,
}

pub fn new_harness() -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let dir = tempfile::tempdir().unwrap();
    let sys = Arc::new(FileSysCatalog::open(dir.path().join("sys_catalog.json")).unwrap());
    let rpc = ScriptedShardRpc::new();
    let clock = Arc::new(ManualClock::new(HybridTimestamp::from_raw(50)));
    let manager = IndexLifecycleManager::load(
        sys.clone(),
        rpc.clone(),
        clock.clone(),
        test_config(),
        1,
    )
    .unwrap();
    Harness {
        dir,
        sys,
        rpc,
        clock,
        manager,
    }
}

/// Rebuild a manager over the same durable catalog, as a new master leader
/// would after a fail-over.
pub fn rebuild_manager(harness: &Harness, leader_term: u64) -> Arc<IndexLifecycleManager> {
    let sys = Arc::new(
        FileSysCatalog::open(harness.dir.path().join("sys_catalog.json")).unwrap(),
    );
    IndexLifecycleManager::load(
        sys,
        harness.rpc.clone(),
        harness.clock.clone(),
        test_config(),
        leader_term,
    )
    .unwrap()
}

pub fn index_descriptor(permission: IndexPermission) -> IndexDescriptor {
    IndexDescriptor {
        index_table_id: INDEX_TABLE,
        index_name: "orders_by_status".to_string(),
        permission,
        key_columns: vec!["status".to_string()],
    }
}

pub fn base_table_record(version: u64, permission: IndexPermission) -> SysTableRecord {
    SysTableRecord {
        table_id: BASE_TABLE,
        table_name: "orders".to_string(),
        version,
        state: TableState::Running,
        schema: lattice_master::catalog::TableSchema {
            columns: vec!["id".to_string(), "status".to_string()],
            properties: Default::default(),
        },
        indexes: vec![index_descriptor(permission)],
        fully_applied_schema: None,
        fully_applied_schema_version: None,
        fully_applied_indexes: None,
    }
}

pub fn index_table_record() -> SysTableRecord {
    let mut record = SysTableRecord {
        table_id: INDEX_TABLE,
        table_name: "orders_by_status".to_string(),
        version: 1,
        state: TableState::Running,
        schema: lattice_master::catalog::TableSchema {
            columns: vec!["status".to_string(), "id".to_string()],
            properties: Default::default(),
        },
        indexes: Vec::new(),
        fully_applied_schema: None,
        fully_applied_schema_version: None,
        fully_applied_indexes: None,
    };
    // Delete markers on the index table are pinned until the backfill ends.
    record.schema.properties.is_backfilling = true;
    record
}

pub fn shard_record(shard_id: ShardId, table_id: TableId, lower: u8, upper: u8) -> SysShardRecord {
    SysShardRecord {
        shard_id,
        table_id,
        start_key: if lower == 0 { Vec::new() } else { vec![lower] },
        end_key: if upper == 0 { Vec::new() } else { vec![upper] },
        backfilled_until: Default::default(),
    }
}

/// Register the standard base table (three shards) and its index table
/// (three shards) with the index in the given permission state.
pub fn seed_tables(harness: &Harness, base_version: u64, permission: IndexPermission) {
    let base_shards = vec![
        shard_record(BASE_SHARDS[0], BASE_TABLE, 0, 0x40),
        shard_record(BASE_SHARDS[1], BASE_TABLE, 0x40, 0x80),
        shard_record(BASE_SHARDS[2], BASE_TABLE, 0x80, 0),
    ];
    harness
        .manager
        .register_table(base_table_record(base_version, permission), base_shards)
        .unwrap();

    let index_shards = vec![
        shard_record(INDEX_SHARDS[0], INDEX_TABLE, 0, 0x40),
        shard_record(INDEX_SHARDS[1], INDEX_TABLE, 0x40, 0x80),
        shard_record(INDEX_SHARDS[2], INDEX_TABLE, 0x80, 0),
    ];
    harness
        .manager
        .register_table(index_table_record(), index_shards)
        .unwrap();
}

/// Poll `condition` until it holds or a generous deadline expires.
pub async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if condition() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
