//! Retry/deadline/cancellation envelopes around shard-leader admin RPCs.
//!
//! The three backfill RPCs (`GetSafeTime`, `BackfillChunk`,
//! `AllowCompactionGc`) are variants of one task abstraction driven by one
//! retry engine: per-attempt deadline, exponential backoff capped by
//! configuration, a retry ceiling, and a short list of shard error codes that
//! fail the task immediately. Task state moves through
//! `Scheduled -> Running -> {Complete, Failed, Aborted, Replaced}` with CAS
//! transitions so a late completion handler can detect it lost the race.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;

use crate::backfill_job::BackfillConfig;
use crate::catalog::{IndexDescriptor, ShardId, SysTableRecord};
use crate::clock::{HybridClock, HybridTimestamp};
use crate::error::{MasterError, ShardError};

/// Base delay for the first retry.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
/// Ceiling on the exponential shift so the factor cannot overflow.
const RETRY_MAX_SHIFT: u32 = 12;

#[derive(Debug, Clone)]
pub struct GetSafeTimeRequest {
    pub shard_id: ShardId,
    /// The returned safe time must be at or above this cutoff.
    pub min_cutoff: HybridTimestamp,
    pub propagated_hybrid_time: HybridTimestamp,
}

#[derive(Debug, Clone)]
pub struct BackfillChunkRequest {
    pub shard_id: ShardId,
    /// Snapshot time of the whole backfill; identical across every chunk of
    /// a job.
    pub read_time: HybridTimestamp,
    pub schema_version: u64,
    /// Resume point; empty means scan from the beginning of the shard.
    pub start_key: Vec<u8>,
    pub index: IndexDescriptor,
    pub propagated_hybrid_time: HybridTimestamp,
}

#[derive(Debug, Clone)]
pub struct AllowCompactionGcRequest {
    pub shard_id: ShardId,
    pub propagated_hybrid_time: HybridTimestamp,
}

/// Response envelope of every shard admin RPC. The propagated time advances
/// the caller's clock even on error responses.
#[derive(Debug, Clone)]
pub struct ShardResponse<T> {
    pub result: Result<T, ShardError>,
    pub propagated_hybrid_time: HybridTimestamp,
}

/// RPC surface of a shard leader, as consumed by the backfill controller.
/// The scan itself runs on the leader; this side only carries the requests.
#[async_trait]
pub trait ShardLeaderRpc: Send + Sync + 'static {
    /// Ask the shard leader for the minimum hybrid time that is safe to read
    /// at, no lower than `min_cutoff`.
    async fn get_safe_time(&self, req: GetSafeTimeRequest) -> ShardResponse<HybridTimestamp>;

    /// Ask the shard leader to scan one chunk from `start_key` at
    /// `read_time`, emitting index entries. Returns the key to resume from,
    /// or empty bytes when the shard is exhausted.
    async fn backfill_chunk(&self, req: BackfillChunkRequest) -> ShardResponse<Vec<u8>>;

    /// Tell an index-table shard leader that delete markers may be reclaimed
    /// by background compaction again.
    async fn allow_compaction_gc(&self, req: AllowCompactionGcRequest) -> ShardResponse<()>;

    /// Best-effort broadcast of a committed schema version to every shard of
    /// the table.
    async fn send_alter_table(&self, table: &SysTableRecord);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Scheduled = 0,
    Running = 1,
    Complete = 2,
    Failed = 3,
    Aborted = 4,
    Replaced = 5,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Scheduled | TaskState::Running)
    }

    fn from_u8(raw: u8) -> TaskState {
        match raw {
            0 => TaskState::Scheduled,
            1 => TaskState::Running,
            2 => TaskState::Complete,
            3 => TaskState::Failed,
            4 => TaskState::Aborted,
            _ => TaskState::Replaced,
        }
    }
}

/// Atomic task state with CAS-only transitions out of non-terminal states.
pub struct TaskStateCell(AtomicU8);

impl TaskStateCell {
    pub fn new(initial: TaskState) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    pub fn load(&self) -> TaskState {
        TaskState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Transition `from -> to`; false if the state moved underneath us.
    pub fn try_transition(&self, from: TaskState, to: TaskState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Force a non-terminal task into `to`, returning the state it left.
    /// Terminal tasks are left alone.
    pub fn force_terminal(&self, to: TaskState) -> TaskState {
        let mut observed = self.load();
        while !observed.is_terminal() {
            if self.try_transition(observed, to) {
                return observed;
            }
            observed = self.load();
        }
        observed
    }
}

/// What a task asks of the shard leader.
#[derive(Debug, Clone)]
pub enum ShardTaskKind {
    GetSafeTime {
        min_cutoff: HybridTimestamp,
    },
    BackfillChunk {
        read_time: HybridTimestamp,
        schema_version: u64,
        start_key: Vec<u8>,
        index: IndexDescriptor,
    },
    AllowCompactionGc,
}

impl ShardTaskKind {
    fn name(&self) -> &'static str {
        match self {
            ShardTaskKind::GetSafeTime { .. } => "GetSafeTime",
            ShardTaskKind::BackfillChunk { .. } => "BackfillChunk",
            ShardTaskKind::AllowCompactionGc => "AllowCompactionGc",
        }
    }
}

/// Successful task payload, matching the kind the task was built with.
#[derive(Debug, Clone)]
pub enum TaskOutput {
    SafeTime(HybridTimestamp),
    NextRowKey(Vec<u8>),
    GcAllowed,
}

/// One request to one shard leader, across all of its retry attempts.
pub struct ShardTask {
    pub shard_id: ShardId,
    pub kind: ShardTaskKind,
    state: TaskStateCell,
    attempts: AtomicU32,
    /// Deadline propagated from the caller; per-attempt deadlines never
    /// extend past it.
    deadline: Option<Instant>,
}

impl ShardTask {
    pub fn new(shard_id: ShardId, kind: ShardTaskKind) -> Self {
        Self {
            shard_id,
            kind,
            state: TaskStateCell::new(TaskState::Scheduled),
            attempts: AtomicU32::new(0),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn state(&self) -> TaskState {
        self.state.load()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Cancel the task. Terminal tasks are left alone.
    pub fn abort(&self) -> TaskState {
        self.state.force_terminal(TaskState::Aborted)
    }

    /// Mark a task that never ran as superseded by a newer one.
    pub fn mark_replaced(&self) -> bool {
        self.state
            .try_transition(TaskState::Scheduled, TaskState::Replaced)
    }

    pub fn description(&self) -> String {
        format!("{} for shard {}", self.kind.name(), self.shard_id)
    }
}

/// Backoff before retry number `attempt` (1-based), capped at `max_delay`
/// with up to 20% additive jitter.
pub fn retry_delay(attempt: u32, max_delay: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(RETRY_MAX_SHIFT);
    let factor = 1u64 << shift;
    let base_ms = RETRY_BASE_DELAY.as_millis() as u64;
    let max_ms = max_delay.as_millis().min(u128::from(u64::MAX)) as u64;
    let capped_ms = base_ms.saturating_mul(factor).min(max_ms);
    let jitter_ms = rand::thread_rng().gen_range(0..=capped_ms / 5);
    Duration::from_millis(capped_ms.saturating_add(jitter_ms).min(max_ms))
}

enum AttemptError {
    Timeout,
    Shard(ShardError),
}

/// Drive one task to a terminal state.
///
/// Non-retryable shard error codes fail the task immediately; every other
/// failure (including an attempt deadline expiry) retries with backoff until
/// the configured ceiling, which is then reported as fatal. An abort raced
/// against a completion surfaces as `InternalError`, never as a success.
pub async fn run_shard_task(
    task: &ShardTask,
    rpc: &dyn ShardLeaderRpc,
    clock: &dyn HybridClock,
    config: &BackfillConfig,
) -> Result<TaskOutput, MasterError> {
    if !task.state.try_transition(TaskState::Scheduled, TaskState::Running) {
        return Err(MasterError::internal(format!(
            "{} in state {:?}",
            task.description(),
            task.state()
        )));
    }

    let max_attempts = config.rpc_max_retries.max(1);
    let mut last_error: Option<AttemptError> = None;

    for attempt in 1..=max_attempts {
        if task.state() != TaskState::Running {
            return Err(MasterError::internal(format!(
                "{} in state {:?}",
                task.description(),
                task.state()
            )));
        }
        task.attempts.store(attempt, Ordering::Release);

        match run_attempt(task, rpc, clock, config).await {
            Ok(output) => {
                if task.state.try_transition(TaskState::Running, TaskState::Complete) {
                    return Ok(output);
                }
                return Err(MasterError::internal(format!(
                    "{} in state {:?}",
                    task.description(),
                    task.state()
                )));
            }
            Err(AttemptError::Shard(err)) if err.code.is_fatal() => {
                tracing::warn!(
                    shard_id = task.shard_id,
                    task = task.kind.name(),
                    code = ?err.code,
                    attempt,
                    "shard task failed, no further retry"
                );
                task.state.try_transition(TaskState::Running, TaskState::Failed);
                return Err(MasterError::FatalShardError {
                    code: Some(err.code),
                    message: err.to_string(),
                });
            }
            Err(err) => {
                match &err {
                    AttemptError::Timeout => tracing::warn!(
                        shard_id = task.shard_id,
                        task = task.kind.name(),
                        attempt,
                        "shard task attempt timed out"
                    ),
                    AttemptError::Shard(shard_err) => tracing::warn!(
                        shard_id = task.shard_id,
                        task = task.kind.name(),
                        code = ?shard_err.code,
                        attempt,
                        "shard task attempt failed, will retry"
                    ),
                }
                last_error = Some(err);
                if attempt < max_attempts {
                    tokio::time::sleep(retry_delay(attempt, config.rpc_max_delay)).await;
                }
            }
        }
    }

    task.state.try_transition(TaskState::Running, TaskState::Failed);
    let (code, detail) = match last_error {
        Some(AttemptError::Shard(err)) => (Some(err.code), err.to_string()),
        Some(AttemptError::Timeout) => (None, "attempt deadline expired".to_string()),
        None => (None, "no attempt ran".to_string()),
    };
    Err(MasterError::FatalShardError {
        code,
        message: format!(
            "{} gave up after {} attempts: {}",
            task.description(),
            max_attempts,
            detail
        ),
    })
}

async fn run_attempt(
    task: &ShardTask,
    rpc: &dyn ShardLeaderRpc,
    clock: &dyn HybridClock,
    config: &BackfillConfig,
) -> Result<TaskOutput, AttemptError> {
    // The attempt deadline is the earlier of the per-attempt timeout and the
    // deadline propagated from the caller.
    let mut budget = config.rpc_timeout;
    if let Some(deadline) = task.deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(AttemptError::Timeout);
        }
        budget = budget.min(remaining);
    }

    let propagated = clock.now();
    match &task.kind {
        ShardTaskKind::GetSafeTime { min_cutoff } => {
            let req = GetSafeTimeRequest {
                shard_id: task.shard_id,
                min_cutoff: *min_cutoff,
                propagated_hybrid_time: propagated,
            };
            let resp = tokio::time::timeout(budget, rpc.get_safe_time(req))
                .await
                .map_err(|_| AttemptError::Timeout)?;
            clock.observe(resp.propagated_hybrid_time);
            let safe_time = resp.result.map_err(AttemptError::Shard)?;
            if !safe_time.is_valid() {
                tracing::error!(
                    shard_id = task.shard_id,
                    "shard returned an invalid safe time"
                );
            }
            Ok(TaskOutput::SafeTime(safe_time))
        }
        ShardTaskKind::BackfillChunk {
            read_time,
            schema_version,
            start_key,
            index,
        } => {
            let req = BackfillChunkRequest {
                shard_id: task.shard_id,
                read_time: *read_time,
                schema_version: *schema_version,
                start_key: start_key.clone(),
                index: index.clone(),
                propagated_hybrid_time: propagated,
            };
            let resp = tokio::time::timeout(budget, rpc.backfill_chunk(req))
                .await
                .map_err(|_| AttemptError::Timeout)?;
            clock.observe(resp.propagated_hybrid_time);
            resp.result
                .map(TaskOutput::NextRowKey)
                .map_err(AttemptError::Shard)
        }
        ShardTaskKind::AllowCompactionGc => {
            let req = AllowCompactionGcRequest {
                shard_id: task.shard_id,
                propagated_hybrid_time: propagated,
            };
            let resp = tokio::time::timeout(budget, rpc.allow_compaction_gc(req))
                .await
                .map_err(|_| AttemptError::Timeout)?;
            clock.observe(resp.propagated_hybrid_time);
            resp.result
                .map(|()| TaskOutput::GcAllowed)
                .map_err(AttemptError::Shard)
        }
    }
}

/// Run a `GetSafeTime` task and unwrap its typed payload.
pub async fn run_get_safe_time(
    task: &ShardTask,
    rpc: &dyn ShardLeaderRpc,
    clock: &dyn HybridClock,
    config: &BackfillConfig,
) -> Result<HybridTimestamp, MasterError> {
    match run_shard_task(task, rpc, clock, config).await? {
        TaskOutput::SafeTime(ht) => Ok(ht),
        other => Err(MasterError::internal(format!(
            "{} produced mismatched output {other:?}",
            task.description()
        ))),
    }
}

/// Run a `BackfillChunk` task and unwrap its typed payload.
pub async fn run_backfill_chunk(
    task: &ShardTask,
    rpc: &dyn ShardLeaderRpc,
    clock: &dyn HybridClock,
    config: &BackfillConfig,
) -> Result<Vec<u8>, MasterError> {
    match run_shard_task(task, rpc, clock, config).await? {
        TaskOutput::NextRowKey(key) => Ok(key),
        other => Err(MasterError::internal(format!(
            "{} produced mismatched output {other:?}",
            task.description()
        ))),
    }
}
