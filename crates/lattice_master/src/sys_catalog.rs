//! Leader-term-gated catalog persistence.
//!
//! Every persist carries the leader term captured by the calling operation;
//! a store that has seen a newer term rejects the write with `NotLeader` and
//! the caller abandons its operation. Batched shard updates commit in a
//! single store write so a crash cannot observe half of them.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::catalog::{SysShardRecord, SysTableRecord, TableId};
use crate::error::MasterError;

/// Catalog store surface consumed by the controller.
///
/// Persist calls are synchronous: they run under the table/shard write locks
/// so the commit of the in-memory state stays atomic with the durable one.
pub trait SysCatalog: Send + Sync + 'static {
    /// Persist one table row, failing `NotLeader` on a stale term.
    fn update_table(&self, record: &SysTableRecord, leader_term: u64) -> Result<(), MasterError>;

    /// Persist many shard rows atomically, failing `NotLeader` on a stale
    /// term.
    fn update_shards(&self, records: &[SysShardRecord], leader_term: u64)
        -> Result<(), MasterError>;

    /// Look up a table row by identity.
    fn find_table(&self, table_id: TableId) -> Result<SysTableRecord, MasterError>;

    /// Full durable state, used to rebuild the in-memory catalog on leader
    /// start.
    fn load_all(&self) -> Result<CatalogSnapshot, MasterError>;
}

/// Durable catalog image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub highest_seen_term: u64,
    pub tables: BTreeMap<TableId, SysTableRecord>,
    pub shards: BTreeMap<u64, SysShardRecord>,
}

/// JSON-file-backed catalog store.
///
/// The whole image is rewritten on every update. That is plenty for a
/// control plane whose rows are small and whose writes are rare; the
/// replicated store this crate is embedded against implements the same trait
/// over its consensus log.
pub struct FileSysCatalog {
    path: PathBuf,
    state: Mutex<CatalogSnapshot>,
}

impl FileSysCatalog {
    /// Open the store at `path`, loading an existing image if one is there.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match fs::read(&path) {
            Ok(data) => serde_json::from_slice::<CatalogSnapshot>(&data)
                .context("decode sys catalog image")?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => CatalogSnapshot::default(),
            Err(err) => return Err(err).context("read sys catalog image"),
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn check_term(state: &mut CatalogSnapshot, leader_term: u64) -> Result<(), MasterError> {
        if leader_term < state.highest_seen_term {
            return Err(MasterError::NotLeader(format!(
                "persist from term {} rejected, highest seen term is {}",
                leader_term, state.highest_seen_term
            )));
        }
        state.highest_seen_term = leader_term;
        Ok(())
    }

    fn persist(&self, state: &CatalogSnapshot) -> Result<(), MasterError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(state)?;
        fs::write(&self.path, data)?;
        Ok(())
    }

    /// Record that a newer leader exists. Subsequent persists from older
    /// terms fail `NotLeader`.
    pub fn observe_term(&self, term: u64) {
        let mut state = self.state.lock().unwrap();
        if term > state.highest_seen_term {
            state.highest_seen_term = term;
        }
    }
}

impl SysCatalog for FileSysCatalog {
    fn update_table(&self, record: &SysTableRecord, leader_term: u64) -> Result<(), MasterError> {
        let mut state = self.state.lock().unwrap();
        Self::check_term(&mut state, leader_term)?;
        state.tables.insert(record.table_id, record.clone());
        self.persist(&state)
    }

    fn update_shards(
        &self,
        records: &[SysShardRecord],
        leader_term: u64,
    ) -> Result<(), MasterError> {
        let mut state = self.state.lock().unwrap();
        Self::check_term(&mut state, leader_term)?;
        for record in records {
            state.shards.insert(record.shard_id, record.clone());
        }
        self.persist(&state)
    }

    fn find_table(&self, table_id: TableId) -> Result<SysTableRecord, MasterError> {
        let state = self.state.lock().unwrap();
        state
            .tables
            .get(&table_id)
            .cloned()
            .ok_or_else(|| MasterError::Incomplete(format!("table {table_id} not found")))
    }

    fn load_all(&self) -> Result<CatalogSnapshot, MasterError> {
        Ok(self.state.lock().unwrap().clone())
    }
}
