//! Node-wide migration coordinator.
//!
//! One coordinator per node drives both sides of the protocol: executors that
//! pull tokens this node gains, and clients that serve peers pulling tokens
//! from this node. At most one target ownership version is in flight.
//!
//! ```text
//!            start_migration / start_resync
//!                       │
//!   Idle ──────────────▶ InProgress ──abort / timeout──▶ Aborted
//!    ▲                       │                              │
//!    └── table closed ───────┘◀──────── next start ─────────┘
//!        resync done
//!        last client failed
//! ```
//!
//! Shards are migrated through a window of at most `parallelism` shards. A
//! two-phase migration walks every shard through round 1, then walks them
//! again through round 2. A one-phase migration (resync) does a single walk.
//!
//! Lock order: `run` → `window` → `executors`. None is held across an await.

use super::client::{ClientFailureSink, ClientParams, FilterSetOutcome, MigrationClient};
use super::executor::{
    ExecutorParams, MigrationExecutor, MigrationRound, ReportSink, RoundOutcome, RoundReport,
};
use super::messages::{
    ForwardedRequest, IoRequest, RebalanceDeltaSet, RebalanceFilterSet, SecondRebalanceRequest,
    SourceResponse,
};
use super::policy::{AbortOnError, ErrorPolicy, FailureAction};
use super::store::ObjectStore;
use super::transport::RebalanceTransport;
use crate::config::MigrationConfig;
use crate::error::{CoordinationError, Error, Result};
use crate::metrics::MigrationMetrics;
use crate::ownership::OwnershipTable;
use crate::types::{
    executor_id, fine_token, shard_for_token, ExecutorId, FineToken, NodeId, ObjectId,
    OwnershipVersion, ShardId, VolumeId, INVALID_VERSION, MAX_TOKEN_BITS,
};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Node-wide migration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MigrationState {
    Idle = 0,
    InProgress = 1,
    Aborted = 2,
}

impl MigrationState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::InProgress,
            _ => Self::Aborted,
        }
    }
}

/// Why a migration runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationKind {
    /// Ownership changed; driven by the orchestrator.
    Rebalance,
    /// Node restarted and catches up with its peers.
    Resync,
}

/// Readiness of one fine token on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FineTokenState {
    /// Owned and serving IO.
    Ready,
    /// Being pulled from a peer.
    MigratingIn,
    NotOwned,
}

/// Completion callback of a migration. Fires exactly once.
pub type MigrationCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// Tokens to pull, grouped by source node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationPlan {
    pub target_version: OwnershipVersion,
    pub token_bits: u32,
    pub sources: BTreeMap<NodeId, BTreeSet<FineToken>>,
}

impl MigrationPlan {
    pub fn new(target_version: OwnershipVersion, token_bits: u32) -> Self {
        Self {
            target_version,
            token_bits,
            sources: BTreeMap::new(),
        }
    }

    /// Pull `tokens` from `source`.
    pub fn with_tokens(mut self, source: NodeId, tokens: impl IntoIterator<Item = FineToken>) -> Self {
        self.sources.entry(source).or_default().extend(tokens);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sources.values().all(BTreeSet::is_empty)
    }

    pub fn token_count(&self) -> usize {
        self.sources.values().map(BTreeSet::len).sum()
    }
}

struct RunState {
    target: OwnershipVersion,
    kind: MigrationKind,
    one_phase: bool,
    token_bits: u32,
    run_id: Uuid,
    started_at: Instant,
    callback: Option<MigrationCallback>,
    timers: Option<CancellationToken>,
    /// This node runs executors for the current target.
    destination_active: bool,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            target: INVALID_VERSION,
            kind: MigrationKind::Rebalance,
            one_phase: false,
            token_bits: 0,
            run_id: Uuid::nil(),
            started_at: Instant::now(),
            callback: None,
            timers: None,
            destination_active: false,
        }
    }
}

#[derive(Debug, Default)]
struct ShardWindow {
    order: Vec<ShardId>,
    cursor: usize,
    in_progress: BTreeSet<ShardId>,
    retry: BTreeSet<ShardId>,
    round: Option<MigrationRound>,
}

impl ShardWindow {
    fn new(order: Vec<ShardId>, round: MigrationRound) -> Self {
        Self {
            order,
            round: Some(round),
            ..Default::default()
        }
    }

    fn next(&mut self) -> Option<ShardId> {
        let shard = *self.order.get(self.cursor)?;
        self.cursor += 1;
        self.in_progress.insert(shard);
        Some(shard)
    }
}

enum Advance {
    Wait,
    StartShard(ShardId),
    StartRound2(ShardId),
    BeginRound2(Vec<ShardId>),
    Finished,
}

type ExecutorMap = BTreeMap<ShardId, BTreeMap<NodeId, Arc<MigrationExecutor>>>;

/// Drives migrations on one node.
pub struct MigrationCoordinator {
    node_id: NodeId,
    config: MigrationConfig,
    store: Arc<dyn ObjectStore>,
    transport: Arc<dyn RebalanceTransport>,
    policy: Arc<dyn ErrorPolicy>,
    metrics: Arc<MigrationMetrics>,
    weak_self: Weak<MigrationCoordinator>,

    state: AtomicU8,
    run: Mutex<RunState>,
    target_version: AtomicU64,
    resync: AtomicBool,
    token_bits: AtomicU32,
    next_local_id: AtomicU32,

    window: Mutex<ShardWindow>,
    executors: Mutex<ExecutorMap>,
    clients: DashMap<ExecutorId, Arc<MigrationClient>>,
    token_states: RwLock<Vec<FineTokenState>>,
    table: RwLock<Option<Arc<OwnershipTable>>>,
}

impl fmt::Debug for MigrationCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationCoordinator")
            .field("node_id", &self.node_id)
            .field("state", &self.state())
            .field("target_version", &self.target_version())
            .field("executors", &self.executor_count())
            .field("clients", &self.client_count())
            .finish()
    }
}

impl MigrationCoordinator {
    /// Create a coordinator with the default abort-on-error policy.
    pub fn new(
        node_id: NodeId,
        config: MigrationConfig,
        store: Arc<dyn ObjectStore>,
        transport: Arc<dyn RebalanceTransport>,
    ) -> Arc<Self> {
        Self::with_policy(node_id, config, store, transport, Arc::new(AbortOnError))
    }

    pub fn with_policy(
        node_id: NodeId,
        config: MigrationConfig,
        store: Arc<dyn ObjectStore>,
        transport: Arc<dyn RebalanceTransport>,
        policy: Arc<dyn ErrorPolicy>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            node_id,
            config,
            store,
            transport,
            policy,
            metrics: Arc::new(MigrationMetrics::new()),
            weak_self: weak_self.clone(),
            state: AtomicU8::new(MigrationState::Idle as u8),
            run: Mutex::new(RunState::default()),
            target_version: AtomicU64::new(INVALID_VERSION),
            resync: AtomicBool::new(false),
            token_bits: AtomicU32::new(0),
            next_local_id: AtomicU32::new(1),
            window: Mutex::new(ShardWindow::default()),
            executors: Mutex::new(BTreeMap::new()),
            clients: DashMap::new(),
            token_states: RwLock::new(Vec::new()),
            table: RwLock::new(None),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn state(&self) -> MigrationState {
        MigrationState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: MigrationState, to: MigrationState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_migration_in_progress(&self) -> bool {
        self.state() == MigrationState::InProgress
    }

    pub fn target_version(&self) -> OwnershipVersion {
        self.target_version.load(Ordering::Acquire)
    }

    pub fn executor_count(&self) -> usize {
        self.executors.lock().values().map(BTreeMap::len).sum()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn metrics(&self) -> &Arc<MigrationMetrics> {
        &self.metrics
    }

    /// State of one fine token, if token states are initialized.
    pub fn token_state(&self, token: FineToken) -> Option<FineTokenState> {
        self.token_states.read().get(token as usize).copied()
    }

    /// Whether IO for `object_id` may be served locally.
    pub fn is_token_ready(&self, object_id: &ObjectId) -> bool {
        let token = fine_token(object_id, self.token_bits.load(Ordering::Acquire));
        self.token_state(token) == Some(FineTokenState::Ready)
    }

    fn report_sink(&self) -> ReportSink {
        let weak = self.weak_self.clone();
        Arc::new(move |report: RoundReport| {
            if let Some(this) = weak.upgrade() {
                this.on_executor_round_done(report);
            }
        })
    }

    fn client_failure_sink(&self) -> ClientFailureSink {
        let weak = self.weak_self.clone();
        Arc::new(move |executor_id| {
            if let Some(this) = weak.upgrade() {
                this.on_client_failed(executor_id);
            }
        })
    }

    fn new_executor(
        &self,
        shard: ShardId,
        source: NodeId,
        target_version: OwnershipVersion,
        token_bits: u32,
        one_phase: bool,
    ) -> Arc<MigrationExecutor> {
        let local = self.next_local_id.fetch_add(1, Ordering::AcqRel);
        Arc::new(MigrationExecutor::new(
            ExecutorParams {
                id: executor_id(self.node_id, local),
                shard,
                source,
                target_version,
                token_bits,
                one_phase,
            },
            Arc::clone(&self.store),
            Arc::clone(&self.transport),
            Arc::clone(&self.metrics),
            self.report_sink(),
        ))
    }

    fn shard_executors(&self, shard: ShardId) -> Vec<Arc<MigrationExecutor>> {
        self.executors
            .lock()
            .get(&shard)
            .map(|by_source| by_source.values().cloned().collect())
            .unwrap_or_default()
    }

    fn update_gauges(&self) {
        self.metrics.executors.set(self.executor_count() as i64);
        self.metrics.clients.set(self.clients.len() as i64);
        self.metrics
            .shards_in_progress
            .set(self.window.lock().in_progress.len() as i64);
    }

    // ------------------------------------------------------------------
    // Destination side
    // ------------------------------------------------------------------

    /// Start pulling the tokens of `plan`.
    ///
    /// A repeated start for the in-flight target is a no-op and its callback
    /// is dropped. A start for a different target fails with `NotReady`.
    pub fn start_migration(
        &self,
        plan: MigrationPlan,
        kind: MigrationKind,
        one_phase: bool,
        callback: MigrationCallback,
    ) -> Result<()> {
        if plan.is_empty() {
            tracing::info!(node = self.node_id, target_version = plan.target_version, "Empty migration plan");
            callback(Ok(()));
            return Ok(());
        }
        if plan.token_bits == 0 || plan.token_bits > MAX_TOKEN_BITS {
            let err = Error::Config(format!("invalid token bits {}", plan.token_bits));
            callback(Err(err.duplicate()));
            return Err(err);
        }
        if let Err(err) = self.config.validate() {
            tracing::error!(node = self.node_id, error = %err, "Migration refused");
            callback(Err(err.duplicate()));
            return Err(err);
        }

        loop {
            match self.state() {
                MigrationState::Idle => {
                    if self.transition(MigrationState::Idle, MigrationState::InProgress) {
                        break;
                    }
                }
                MigrationState::Aborted => {
                    if self.transition(MigrationState::Aborted, MigrationState::InProgress) {
                        break;
                    }
                }
                MigrationState::InProgress => {
                    let run = self.run.lock();
                    if run.target != plan.target_version {
                        let err = CoordinationError::NotReady {
                            in_flight: run.target,
                            requested: plan.target_version,
                        };
                        drop(run);
                        tracing::warn!(node = self.node_id, error = %err, "Migration refused");
                        callback(Err(err.clone().into()));
                        return Err(err.into());
                    }
                    if run.destination_active {
                        tracing::debug!(node = self.node_id, target_version = plan.target_version, "Migration already running");
                        return Ok(());
                    }
                    break;
                }
            }
        }

        let run_id = Uuid::new_v4();
        {
            let mut run = self.run.lock();
            run.target = plan.target_version;
            run.kind = kind;
            run.one_phase = one_phase;
            run.token_bits = plan.token_bits;
            run.run_id = run_id;
            run.started_at = Instant::now();
            run.callback = Some(callback);
            run.destination_active = true;
        }
        self.target_version
            .store(plan.target_version, Ordering::Release);
        self.resync
            .store(kind == MigrationKind::Resync, Ordering::Release);
        self.token_bits.store(plan.token_bits, Ordering::Release);

        self.metrics.migrations_started.inc();
        if kind == MigrationKind::Resync {
            self.metrics.resyncs_started.inc();
        }

        let token_count = 1usize << plan.token_bits;
        {
            let mut states = self.token_states.write();
            if states.len() != token_count {
                *states = vec![FineTokenState::NotOwned; token_count];
            }
            for token in plan.sources.values().flatten() {
                if let Some(state) = states.get_mut(*token as usize) {
                    *state = FineTokenState::MigratingIn;
                }
            }
        }

        let mut built: ExecutorMap = BTreeMap::new();
        for (source, tokens) in &plan.sources {
            for token in tokens {
                if *token as usize >= token_count {
                    tracing::warn!(token, token_bits = plan.token_bits, "Token outside keyspace ignored");
                    continue;
                }
                let shard = shard_for_token(*token);
                built
                    .entry(shard)
                    .or_default()
                    .entry(*source)
                    .or_insert_with(|| {
                        self.new_executor(
                            shard,
                            *source,
                            plan.target_version,
                            plan.token_bits,
                            one_phase,
                        )
                    })
                    .add_token(*token);
            }
        }
        let shards: Vec<ShardId> = built.keys().copied().collect();
        *self.executors.lock() = built;

        let first_round = if one_phase {
            MigrationRound::Second
        } else {
            MigrationRound::First
        };
        let to_start = {
            let mut window = self.window.lock();
            *window = ShardWindow::new(shards.clone(), first_round);
            (0..self.config.parallelism)
                .map_while(|_| window.next())
                .collect::<Vec<_>>()
        };

        tracing::info!(
            node = self.node_id,
            %run_id,
            target_version = plan.target_version,
            ?kind,
            one_phase,
            shards = shards.len(),
            tokens = plan.token_count(),
            "Migration started"
        );

        self.arm_timers();
        self.update_gauges();
        for shard in to_start {
            self.start_shard(shard);
        }
        Ok(())
    }

    /// Pull every owned token from its best peer after a restart.
    pub fn start_resync(&self, table: Arc<OwnershipTable>) -> Result<()> {
        let token_bits = table.token_bits();
        *self.table.write() = Some(Arc::clone(&table));

        let mut plan = MigrationPlan::new(table.version(), token_bits);
        let mut without_peer = Vec::new();
        for token in table.tokens_for_node(self.node_id) {
            match table.best_peer(token, self.node_id) {
                Some(peer) => {
                    plan.sources.entry(peer).or_default().insert(token);
                }
                None => without_peer.push(token),
            }
        }

        {
            let mut states = self.token_states.write();
            if states.len() != table.token_count() {
                *states = vec![FineTokenState::NotOwned; table.token_count()];
            }
            for token in &without_peer {
                if let Some(state) = states.get_mut(*token as usize) {
                    *state = FineTokenState::Ready;
                }
            }
        }
        self.token_bits.store(token_bits, Ordering::Release);

        let node = self.node_id;
        let version = table.version();
        self.start_migration(
            plan,
            MigrationKind::Resync,
            true,
            Box::new(move |result| match result {
                Ok(()) => tracing::info!(node, version, "Resync complete"),
                Err(e) => tracing::error!(node, version, error = %e, "Resync failed"),
            }),
        )
    }

    fn arm_timers(&self) {
        let token = CancellationToken::new();
        if let Some(old) = self.run.lock().timers.replace(token.clone()) {
            old.cancel();
        }

        let weak = self.weak_self.clone();
        let retry_interval = self.config.retry_interval;
        let timeout = self.config.migration_timeout;
        tokio::spawn(async move {
            let mut retry = tokio::time::interval_at(
                tokio::time::Instant::now() + retry_interval,
                retry_interval,
            );
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = retry.tick() => {
                        match weak.upgrade() {
                            Some(this) => this.retry_failed_shards(),
                            None => break,
                        }
                    }
                    _ = &mut deadline => {
                        if let Some(this) = weak.upgrade() {
                            this.timeout_abort().await;
                        }
                        break;
                    }
                }
            }
        });
    }

    /// Snapshot a shard and run round 1 on its executors.
    fn start_shard(&self, shard: ShardId) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if !this.is_migration_in_progress() {
                return;
            }
            let executors = this.shard_executors(shard);
            this.metrics.snapshots_requested.inc();
            let token_bits = this.token_bits.load(Ordering::Acquire);
            match this.store.snapshot(shard, token_bits).await {
                Ok(snapshot) => {
                    for executor in executors {
                        executor.start_round1(&snapshot).await;
                    }
                }
                Err(e) => {
                    tracing::error!(node = this.node_id, shard, error = %e, "Shard snapshot failed");
                    this.abort_migration(e).await;
                }
            }
        });
    }

    fn start_round2(&self, shard: ShardId) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            for executor in this.shard_executors(shard) {
                executor.start_round2().await;
            }
            // Executors skipped after a failure never report round 2.
            if this.is_migration_in_progress() {
                this.advance_if_shard_done(shard, MigrationRound::Second);
            }
        });
    }

    /// Restart shards whose source answered NotReady.
    pub fn retry_failed_shards(&self) {
        if !self.is_migration_in_progress() {
            return;
        }
        let shards = std::mem::take(&mut self.window.lock().retry);
        for shard in shards {
            tracing::debug!(node = self.node_id, shard, "Retrying shard");
            self.metrics.source_not_ready_retries.inc();
            self.start_shard(shard);
        }
    }

    /// Handle an executor report.
    pub fn on_executor_round_done(&self, report: RoundReport) {
        if !self.is_migration_in_progress() {
            return;
        }
        let RoundReport {
            shard,
            source,
            round,
            outcome,
            tokens,
            ..
        } = report;

        match outcome {
            RoundOutcome::SourceDeclined => {
                self.set_token_states(&tokens, FineTokenState::Ready);
                return;
            }
            RoundOutcome::SourceNotReady => {
                tracing::info!(node = self.node_id, shard, source, "Source not ready");
                self.window.lock().retry.insert(shard);
                return;
            }
            RoundOutcome::Completed => {
                if round == MigrationRound::Second {
                    self.set_token_states(&tokens, FineTokenState::Ready);
                }
            }
            RoundOutcome::Failed(error) => {
                let kind = self.run.lock().kind;
                match self.policy.on_error(&error, kind) {
                    FailureAction::Abort => {
                        if let Some(this) = self.weak_self.upgrade() {
                            tokio::spawn(async move { this.abort_migration(error).await });
                        }
                        return;
                    }
                    FailureAction::ReplaceSource => {
                        if self.replace_source(shard, source, &tokens) {
                            return;
                        }
                        tracing::warn!(node = self.node_id, shard, source, error = %error, "No replacement source, executor left in error");
                    }
                    FailureAction::Skip => {
                        tracing::warn!(node = self.node_id, shard, error = %error, "Skipping failed executor");
                    }
                }
            }
        }

        if round != MigrationRound::Filter {
            self.advance_if_shard_done(shard, round);
        }
    }

    /// Move the window on once every executor of `shard` finished `round`.
    fn advance_if_shard_done(&self, shard: ShardId, round: MigrationRound) {
        if !self
            .shard_executors(shard)
            .iter()
            .all(|e| e.is_round_done(round))
        {
            return;
        }

        let one_phase = self.run.lock().one_phase;
        let advance = {
            let mut window = self.window.lock();
            if window.round != Some(round) || !window.in_progress.remove(&shard) {
                return;
            }
            window.retry.remove(&shard);
            match window.next() {
                Some(next) if round == MigrationRound::First || one_phase => {
                    Advance::StartShard(next)
                }
                Some(next) => Advance::StartRound2(next),
                None if !window.in_progress.is_empty() => Advance::Wait,
                None if round == MigrationRound::First => {
                    let order = std::mem::take(&mut window.order);
                    *window = ShardWindow::new(order, MigrationRound::Second);
                    Advance::BeginRound2(
                        (0..self.config.parallelism)
                            .map_while(|_| window.next())
                            .collect(),
                    )
                }
                None => Advance::Finished,
            }
        };
        self.update_gauges();

        match advance {
            Advance::Wait => {}
            Advance::StartShard(shard) => self.start_shard(shard),
            Advance::StartRound2(shard) => self.start_round2(shard),
            Advance::BeginRound2(shards) => {
                tracing::info!(node = self.node_id, shards = shards.len(), "Round 1 complete on all shards");
                for shard in shards {
                    self.start_round2(shard);
                }
            }
            Advance::Finished => self.finish_migration(),
        }
    }

    fn replace_source(&self, shard: ShardId, failed: NodeId, tokens: &BTreeSet<FineToken>) -> bool {
        let Some(source) = self.policy.replace_source(shard, failed, tokens) else {
            return false;
        };
        let (target, token_bits, one_phase) = {
            let run = self.run.lock();
            (run.target, run.token_bits, run.one_phase)
        };
        let executor = self.new_executor(shard, source, target, token_bits, one_phase);
        for token in tokens {
            executor.add_token(*token);
        }
        tracing::info!(node = self.node_id, shard, failed, replacement = source, "Replacing migration source");
        self.executors
            .lock()
            .entry(shard)
            .or_default()
            .insert(source, Arc::clone(&executor));

        let Some(this) = self.weak_self.upgrade() else {
            return false;
        };
        tokio::spawn(async move {
            match this.store.snapshot(shard, token_bits).await {
                Ok(snapshot) => executor.start_round1(&snapshot).await,
                Err(e) => {
                    tracing::error!(node = this.node_id, shard, error = %e, "Snapshot for replacement source failed");
                    this.abort_migration(e).await;
                }
            }
        });
        true
    }

    fn set_token_states(&self, tokens: &BTreeSet<FineToken>, state: FineTokenState) {
        let mut states = self.token_states.write();
        for token in tokens {
            if let Some(slot) = states.get_mut(*token as usize) {
                *slot = state;
            }
        }
    }

    fn finish_migration(&self) {
        let (callback, timers, started_at, kind, run_id, target) = {
            let mut run = self.run.lock();
            (
                run.callback.take(),
                run.timers.take(),
                run.started_at,
                run.kind,
                run.run_id,
                run.target,
            )
        };
        if let Some(timers) = timers {
            timers.cancel();
        }
        let Some(callback) = callback else {
            return;
        };

        let elapsed = started_at.elapsed();
        self.metrics.record_finished(elapsed, None);
        tracing::info!(node = self.node_id, %run_id, target_version = target, ?kind, elapsed_ms = elapsed.as_millis() as u64, "Migration complete");
        callback(Ok(()));

        if kind == MigrationKind::Resync {
            self.executors.lock().clear();
            self.check_resync_done();
        }
        self.update_gauges();
    }

    /// Resync ends once no executor and no client is left.
    fn check_resync_done(&self) {
        if !self.resync.load(Ordering::Acquire) {
            return;
        }
        if self.executor_count() != 0 || !self.clients.is_empty() {
            return;
        }
        let mut run = self.run.lock();
        if run.callback.is_some() {
            return;
        }
        if self.transition(MigrationState::InProgress, MigrationState::Idle) {
            *run = RunState::default();
            self.target_version.store(INVALID_VERSION, Ordering::Release);
            self.resync.store(false, Ordering::Release);
            tracing::info!(node = self.node_id, "Resync finished on both sides");
        }
    }

    /// Abort the in-flight migration. Idempotent.
    pub async fn abort_migration(&self, error: Error) {
        if !self.transition(MigrationState::InProgress, MigrationState::Aborted) {
            return;
        }
        let (callback, timers, started_at, run_id) = {
            let mut run = self.run.lock();
            (
                run.callback.take(),
                run.timers.take(),
                run.started_at,
                run.run_id,
            )
        };
        if let Some(timers) = timers {
            timers.cancel();
        }
        let reason = abort_reason(&error);
        tracing::warn!(node = self.node_id, %run_id, reason, error = %error, "Migration aborted");
        self.metrics
            .record_finished(started_at.elapsed(), Some(reason));

        let tasks = self.detach_tasks();
        {
            let mut states = self.token_states.write();
            for state in states.iter_mut() {
                if *state == FineTokenState::MigratingIn {
                    *state = FineTokenState::NotOwned;
                }
            }
        }
        if let Some(callback) = callback {
            callback(Err(error));
        }
        tasks.drain().await;
        self.update_gauges();
    }

    /// Abort because the migration ran past its deadline.
    pub async fn timeout_abort(&self) {
        self.abort_migration(Error::Timeout).await;
    }

    /// Detach every executor and client and reset the run, so a new
    /// migration can start while the old tasks drain.
    fn detach_tasks(&self) -> DetachedTasks {
        let executors: Vec<Arc<MigrationExecutor>> = std::mem::take(&mut *self.executors.lock())
            .into_values()
            .flat_map(BTreeMap::into_values)
            .collect();
        let clients: Vec<Arc<MigrationClient>> =
            self.clients.iter().map(|e| Arc::clone(e.value())).collect();
        self.clients.clear();

        *self.window.lock() = ShardWindow::default();
        *self.run.lock() = RunState::default();
        self.target_version.store(INVALID_VERSION, Ordering::Release);
        self.resync.store(false, Ordering::Release);

        for executor in &executors {
            executor.cancel();
        }
        for client in &clients {
            client.cancel();
        }
        DetachedTasks { executors, clients }
    }

    /// Route a delta set to its executor.
    pub async fn on_delta_set_received(&self, delta_set: RebalanceDeltaSet) -> Result<()> {
        if !self.is_migration_in_progress() {
            return Err(CoordinationError::Aborted("no migration in progress".into()).into());
        }
        let shards: Vec<ShardId> = self.window.lock().in_progress.iter().copied().collect();
        let executor = shards
            .into_iter()
            .flat_map(|shard| self.shard_executors(shard))
            .find(|e| e.id() == delta_set.executor_id)
            .ok_or(CoordinationError::UnknownExecutor(delta_set.executor_id))?;
        executor.apply_delta_set(&delta_set).await
    }

    /// The source serving one of this node's executors gave up on it.
    pub fn on_source_aborted(&self, executor_id: ExecutorId, reason: &str) -> Result<()> {
        let executor = self
            .executors
            .lock()
            .values()
            .flat_map(BTreeMap::values)
            .find(|e| e.id() == executor_id)
            .cloned()
            .ok_or(CoordinationError::UnknownExecutor(executor_id))?;
        tracing::warn!(node = self.node_id, executor_id, source = executor.source(), reason, "Source aborted executor");
        executor.abort_from_source(reason);
        Ok(())
    }

    /// Apply a live request a source mirrored to this node.
    pub async fn on_forwarded_request(&self, forwarded: ForwardedRequest) -> Result<()> {
        self.store.apply_forwarded(&forwarded.request).await
    }

    // ------------------------------------------------------------------
    // Source side
    // ------------------------------------------------------------------

    /// Handle a filter set from a remote executor on `executor_node`.
    pub fn start_object_rebalance(
        &self,
        filter_set: RebalanceFilterSet,
        executor_node: NodeId,
    ) -> Result<SourceResponse> {
        let token = filter_set.token;
        let accepted = self.accepts_token(&filter_set, executor_node);

        loop {
            match self.state() {
                MigrationState::Aborted => {
                    return Err(CoordinationError::AlreadyAborted.into());
                }
                MigrationState::Idle => {
                    if self.transition(MigrationState::Idle, MigrationState::InProgress) {
                        let mut run = self.run.lock();
                        run.target = filter_set.target_version;
                        run.kind = if filter_set.one_phase {
                            MigrationKind::Resync
                        } else {
                            MigrationKind::Rebalance
                        };
                        run.one_phase = filter_set.one_phase;
                        self.target_version
                            .store(filter_set.target_version, Ordering::Release);
                        self.resync.store(filter_set.one_phase, Ordering::Release);
                        break;
                    }
                }
                MigrationState::InProgress => {
                    let target = self.run.lock().target;
                    if !filter_set.one_phase
                        && target != INVALID_VERSION
                        && target != filter_set.target_version
                    {
                        tracing::info!(node = self.node_id, in_flight = target, requested = filter_set.target_version, "Source busy with another target");
                        return Ok(SourceResponse::NotReady);
                    }
                    break;
                }
            }
        }

        let executor_id = filter_set.executor_id;
        let client = self
            .clients
            .entry(executor_id)
            .or_insert_with(|| {
                Arc::new(MigrationClient::new(
                    ClientParams {
                        executor_id,
                        destination: executor_node,
                        shard: filter_set.shard,
                        token_bits: self.token_bits_for(&filter_set),
                        one_phase: filter_set.one_phase,
                        max_delta_set_size: self.config.max_delta_set_size,
                    },
                    Arc::clone(&self.store),
                    Arc::clone(&self.transport),
                    Arc::clone(&self.metrics),
                    self.client_failure_sink(),
                ))
            })
            .clone();

        let outcome = client.handle_filter_set(filter_set, accepted)?;
        if outcome == FilterSetOutcome::AllDeclined {
            self.clients.remove(&executor_id);
            self.check_resync_done();
        }
        self.update_gauges();

        if accepted {
            Ok(SourceResponse::Accepted)
        } else {
            tracing::debug!(node = self.node_id, token, executor_node, "Declined token");
            Ok(SourceResponse::Declined)
        }
    }

    fn token_bits_for(&self, filter_set: &RebalanceFilterSet) -> u32 {
        match self.table.read().as_ref() {
            Some(table) => table.token_bits(),
            None => {
                let bits = self.token_bits.load(Ordering::Acquire);
                if bits == 0 {
                    tracing::warn!(node = self.node_id, shard = filter_set.shard, "Serving filter set without an ownership table");
                }
                bits
            }
        }
    }

    /// A token this node is itself pulling is declined, except in a resync
    /// where the table prefers this node over the requester.
    fn accepts_token(&self, filter_set: &RebalanceFilterSet, executor_node: NodeId) -> bool {
        let pulling = self
            .shard_executors(filter_set.shard)
            .iter()
            .any(|e| e.responsible_for(filter_set.token));
        if !pulling {
            return true;
        }
        if !filter_set.one_phase {
            tracing::error!(node = self.node_id, token = filter_set.token, executor_node, "Peer asks for a token this node is pulling");
            return false;
        }
        match self.table.read().as_ref() {
            Some(table) => {
                table.prefers(filter_set.token, executor_node, self.node_id) != Some(executor_node)
            }
            None => true,
        }
    }

    /// Start round 2 for a remote executor.
    pub fn start_second_object_rebalance(
        &self,
        request: SecondRebalanceRequest,
        executor_node: NodeId,
    ) -> Result<()> {
        if self.state() == MigrationState::Aborted {
            return Err(CoordinationError::AlreadyAborted.into());
        }
        let client = self
            .clients
            .get(&request.executor_id)
            .map(|c| Arc::clone(c.value()))
            .ok_or(CoordinationError::UnknownExecutor(request.executor_id))?;
        tracing::debug!(node = self.node_id, executor_node, shard = client.shard(), "Second round requested");
        client.start_second_phase()
    }

    /// A resync executor finished with this node.
    pub async fn finish_client_resync(&self, executor_id: ExecutorId) {
        let removed = self.clients.remove(&executor_id);
        if let Some((_, client)) = removed {
            client.cancel();
            client.wait_for_io_completion().await;
        }
        self.update_gauges();
        self.check_resync_done();
    }

    /// A client failed and already told its destination. A node serving no
    /// one and pulling nothing goes back to idle.
    fn on_client_failed(&self, executor_id: ExecutorId) {
        let Some((_, client)) = self.clients.remove(&executor_id) else {
            return;
        };
        client.cancel();
        self.update_gauges();
        if !self.clients.is_empty() {
            return;
        }
        let mut run = self.run.lock();
        if run.destination_active {
            return;
        }
        if self.transition(MigrationState::InProgress, MigrationState::Idle) {
            *run = RunState::default();
            self.target_version.store(INVALID_VERSION, Ordering::Release);
            self.resync.store(false, Ordering::Release);
            tracing::info!(node = self.node_id, executor_id, "Last client failed, source idle");
        }
    }

    // ------------------------------------------------------------------
    // IO path
    // ------------------------------------------------------------------

    /// Mirror a live request to destinations pulling its token.
    ///
    /// Requests already tagged with the target version were routed by the
    /// new table and are not mirrored, except during resync.
    pub fn forward_if_needed(
        &self,
        object_id: &ObjectId,
        request_version: OwnershipVersion,
        request: &IoRequest,
    ) -> bool {
        if let IoRequest::AddObjectRef {
            src_volume,
            dst_volume,
            object_ids,
        } = request
        {
            return self.forward_add_refs_if_needed(
                request_version,
                *src_volume,
                *dst_volume,
                object_ids,
            );
        }
        if !self.should_forward(request_version) {
            return false;
        }
        let token = fine_token(object_id, self.token_bits.load(Ordering::Acquire));
        self.forward_token(token, request)
    }

    /// Mirror an add-reference request, split by fine token.
    pub fn forward_add_refs_if_needed(
        &self,
        request_version: OwnershipVersion,
        src_volume: VolumeId,
        dst_volume: VolumeId,
        object_ids: &[ObjectId],
    ) -> bool {
        if !self.should_forward(request_version) {
            return false;
        }
        let token_bits = self.token_bits.load(Ordering::Acquire);
        let mut by_token: BTreeMap<FineToken, Vec<ObjectId>> = BTreeMap::new();
        for id in object_ids {
            by_token
                .entry(fine_token(id, token_bits))
                .or_default()
                .push(*id);
        }

        let mut forwarded = false;
        for (token, ids) in by_token {
            let request = IoRequest::AddObjectRef {
                src_volume,
                dst_volume,
                object_ids: ids,
            };
            forwarded |= self.forward_token(token, &request);
        }
        forwarded
    }

    fn should_forward(&self, request_version: OwnershipVersion) -> bool {
        if !self.is_migration_in_progress() || self.clients.is_empty() {
            return false;
        }
        self.resync.load(Ordering::Acquire)
            || request_version != self.target_version.load(Ordering::Acquire)
    }

    fn forward_token(&self, token: FineToken, request: &IoRequest) -> bool {
        let clients: Vec<Arc<MigrationClient>> =
            self.clients.iter().map(|e| Arc::clone(e.value())).collect();
        let mut forwarded = false;
        for client in clients {
            forwarded |= client.forward_if_needed(token, request);
        }
        forwarded
    }

    // ------------------------------------------------------------------
    // Ownership table lifecycle
    // ------------------------------------------------------------------

    /// Record a new ownership table. Token states are initialized from it
    /// the first time, when no migration is running.
    pub fn notify_ownership_update(&self, table: Arc<OwnershipTable>) {
        *self.table.write() = Some(Arc::clone(&table));
        if self.is_migration_in_progress() {
            return;
        }
        self.token_bits.store(table.token_bits(), Ordering::Release);
        let mut states = self.token_states.write();
        if states.is_empty() {
            let owned = table.tokens_for_node(self.node_id);
            *states = (0..table.token_count() as FineToken)
                .map(|t| {
                    if owned.contains(&t) {
                        FineTokenState::Ready
                    } else {
                        FineTokenState::NotOwned
                    }
                })
                .collect();
        }
    }

    /// The orchestrator committed `table`; the migration toward it is over.
    pub async fn on_ownership_table_closed(&self, table: Arc<OwnershipTable>) -> Result<()> {
        if self.resync.load(Ordering::Acquire) {
            tracing::warn!(node = self.node_id, version = table.version(), "Ownership table closed during resync ignored");
            return Ok(());
        }

        {
            let mut states = self.token_states.write();
            for (token, state) in states.iter_mut().enumerate() {
                if *state == FineTokenState::Ready
                    && table.priority_of(token as FineToken, self.node_id).is_none()
                {
                    *state = FineTokenState::NotOwned;
                }
            }
        }
        *self.table.write() = Some(Arc::clone(&table));

        if !self.transition(MigrationState::InProgress, MigrationState::Idle) {
            return Ok(());
        }
        let (callback, timers) = {
            let mut run = self.run.lock();
            (run.callback.take(), run.timers.take())
        };
        if let Some(timers) = timers {
            timers.cancel();
        }
        if let Some(callback) = callback {
            callback(Err(CoordinationError::Aborted(format!(
                "ownership table {} closed before migration finished",
                table.version()
            ))
            .into()));
        }

        self.detach_tasks().drain().await;
        self.update_gauges();
        tracing::info!(node = self.node_id, version = table.version(), "Ownership table closed");
        Ok(())
    }
}

/// Executors and clients removed from the coordinator, still draining.
struct DetachedTasks {
    executors: Vec<Arc<MigrationExecutor>>,
    clients: Vec<Arc<MigrationClient>>,
}

impl DetachedTasks {
    async fn drain(self) {
        for executor in self.executors {
            executor.wait_for_io_completion().await;
        }
        for client in self.clients {
            client.wait_for_io_completion().await;
        }
    }
}

fn abort_reason(error: &Error) -> &'static str {
    match error {
        Error::Timeout => "timeout",
        Error::Cancelled => "cancelled",
        Error::Transport(_) => "transport",
        Error::Store(_) => "store",
        Error::Coordination(_) => "coordination",
        Error::Placement(_) | Error::Format(_) => "placement",
        Error::Config(_) | Error::Internal(_) => "internal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StoreError, TransportError};
    use crate::migration::messages::MetadataSnapshot;
    use crate::migration::policy::SkipFailedTokens;
    use crate::migration::store::InMemoryObjectStore;
    use crate::migration::transport::LocalNetwork;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::{oneshot, Semaphore};

    const BITS: u32 = 8;
    const A: NodeId = 1 << 32;
    const B: NodeId = 2 << 32;
    const C: NodeId = 3 << 32;

    /// In-memory store whose shard snapshots wait for a permit. Closing the
    /// gate fails snapshots.
    #[derive(Debug)]
    struct GatedStore {
        inner: InMemoryObjectStore,
        gate: Semaphore,
        calls: Mutex<Vec<ShardId>>,
        fail_reads: AtomicBool,
    }

    impl GatedStore {
        fn new(permits: usize) -> Arc<Self> {
            Arc::new(Self {
                inner: InMemoryObjectStore::new(),
                gate: Semaphore::new(permits),
                calls: Mutex::new(Vec::new()),
                fail_reads: AtomicBool::new(false),
            })
        }

        fn open() -> Arc<Self> {
            Self::new(Semaphore::MAX_PERMITS)
        }

        fn calls(&self) -> Vec<ShardId> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl ObjectStore for GatedStore {
        async fn snapshot(&self, shard: ShardId, token_bits: u32) -> Result<MetadataSnapshot> {
            self.calls.lock().push(shard);
            self.gate
                .acquire()
                .await
                .map_err(|e| Error::Internal(e.to_string()))?
                .forget();
            self.inner.snapshot(shard, token_bits).await
        }

        async fn read_object_data(&self, object_id: &ObjectId) -> Result<Bytes> {
            if self.fail_reads.load(Ordering::Acquire) {
                return Err(StoreError::ObjectNotFound(object_id.to_string()).into());
            }
            self.inner.read_object_data(object_id).await
        }

        async fn apply_delta_object(
            &self,
            object: &crate::migration::messages::DeltaObject,
        ) -> Result<()> {
            self.inner.apply_delta_object(object).await
        }

        async fn apply_forwarded(&self, request: &IoRequest) -> Result<()> {
            self.inner.apply_forwarded(request).await
        }
    }

    struct TestNode {
        coordinator: Arc<MigrationCoordinator>,
        store: Arc<GatedStore>,
    }

    fn config() -> MigrationConfig {
        MigrationConfig::default().with_retry_interval(Duration::from_millis(20))
    }

    fn add_node(
        network: &Arc<LocalNetwork>,
        node: NodeId,
        config: MigrationConfig,
        store: Arc<GatedStore>,
        policy: Arc<dyn ErrorPolicy>,
    ) -> TestNode {
        let coordinator = MigrationCoordinator::with_policy(
            node,
            config,
            store.clone(),
            network.transport(node),
            policy,
        );
        network.register(&coordinator);
        TestNode { coordinator, store }
    }

    fn pair(config: MigrationConfig, dest_store: Arc<GatedStore>) -> (Arc<LocalNetwork>, TestNode, TestNode) {
        let network = LocalNetwork::new();
        let a = add_node(&network, A, config.clone(), GatedStore::open(), Arc::new(AbortOnError));
        let b = add_node(&network, B, config, dest_store, Arc::new(AbortOnError));
        (network, a, b)
    }

    /// Table with `overrides` and every other token on `default`.
    fn table(
        version: OwnershipVersion,
        default: &[NodeId],
        overrides: &[(FineToken, &[NodeId])],
    ) -> Arc<OwnershipTable> {
        let mut table = OwnershipTable::new(version, BITS).unwrap();
        for token in 0..table.token_count() as FineToken {
            table.set_token_nodes(token, default.to_vec()).unwrap();
        }
        for (token, nodes) in overrides {
            table.set_token_nodes(*token, nodes.to_vec()).unwrap();
        }
        Arc::new(table)
    }

    fn object(token: FineToken, n: u8) -> ObjectId {
        let mut raw = [0u8; 16];
        raw[0] = token as u8;
        raw[15] = n;
        ObjectId::from_bytes(raw)
    }

    fn fill(store: &GatedStore, tokens: impl IntoIterator<Item = FineToken>, per_token: u8) {
        for token in tokens {
            for n in 0..per_token {
                store
                    .inner
                    .put(object(token, n), 1, Bytes::from(vec![token as u8, n]));
            }
        }
    }

    fn callback() -> (MigrationCallback, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
            rx,
        )
    }

    async fn finished(rx: oneshot::Receiver<Result<()>>) -> Result<()> {
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("migration did not finish")
            .expect("callback dropped")
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    fn moved_tokens() -> Vec<(FineToken, &'static [NodeId])> {
        (1..=4).map(|t| (t, &[B][..])).collect()
    }

    #[test_log::test(tokio::test)]
    async fn test_two_phase_migration_moves_objects() {
        let (_network, a, b) = pair(config(), GatedStore::open());
        let v1 = table(1, &[A], &[]);
        let v2 = table(2, &[A], &moved_tokens());
        a.coordinator.notify_ownership_update(v1.clone());
        b.coordinator.notify_ownership_update(v1);
        fill(&a.store, 1..=5, 3);

        let (cb, rx) = callback();
        let plan = MigrationPlan::new(2, BITS).with_tokens(A, 1..=4);
        b.coordinator
            .start_migration(plan, MigrationKind::Rebalance, false, cb)
            .unwrap();
        finished(rx).await.unwrap();

        let copied = b.store.inner.live_objects();
        assert_eq!(copied.len(), 12);
        assert!(!copied.contains_key(&object(5, 0)));
        for token in 1..=4 {
            assert_eq!(b.coordinator.token_state(token), Some(FineTokenState::Ready));
            assert!(b.coordinator.is_token_ready(&object(token, 0)));
        }
        assert_eq!(b.coordinator.token_state(5), Some(FineTokenState::NotOwned));
        assert_eq!(b.coordinator.executor_count(), 4);
        assert_eq!(a.coordinator.client_count(), 4);
        assert_eq!(b.coordinator.metrics().snapshot().migrations_completed, 1);

        a.coordinator
            .on_ownership_table_closed(v2.clone())
            .await
            .unwrap();
        b.coordinator.on_ownership_table_closed(v2).await.unwrap();
        assert_eq!(a.coordinator.state(), MigrationState::Idle);
        assert_eq!(b.coordinator.state(), MigrationState::Idle);
        assert_eq!(a.coordinator.client_count(), 0);
        assert_eq!(b.coordinator.executor_count(), 0);
        assert_eq!(a.coordinator.token_state(1), Some(FineTokenState::NotOwned));
        assert_eq!(a.coordinator.token_state(5), Some(FineTokenState::Ready));
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_refuses_other_target() {
        let (_network, a, b) = pair(config(), GatedStore::new(0));
        a.coordinator.notify_ownership_update(table(1, &[A], &[]));
        let fired = Arc::new(AtomicUsize::new(0));

        let counting = |fired: &Arc<AtomicUsize>| -> MigrationCallback {
            let fired = Arc::clone(fired);
            Box::new(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };
        let plan = MigrationPlan::new(2, BITS).with_tokens(A, 1..=4);
        b.coordinator
            .start_migration(plan.clone(), MigrationKind::Rebalance, false, counting(&fired))
            .unwrap();
        assert_eq!(b.coordinator.executor_count(), 4);

        b.coordinator
            .start_migration(plan, MigrationKind::Rebalance, false, counting(&fired))
            .unwrap();
        assert_eq!(b.coordinator.executor_count(), 4);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let (cb, rx) = callback();
        let other = MigrationPlan::new(3, BITS).with_tokens(A, [7]);
        let err = b
            .coordinator
            .start_migration(other, MigrationKind::Rebalance, false, cb)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Coordination(CoordinationError::NotReady {
                in_flight: 2,
                requested: 3
            })
        ));
        assert!(matches!(
            finished(rx).await,
            Err(Error::Coordination(CoordinationError::NotReady { .. }))
        ));
        assert_eq!(b.coordinator.target_version(), 2);

        b.coordinator.abort_migration(Error::Cancelled).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_plan_completes_immediately() {
        let (_network, _a, b) = pair(config(), GatedStore::open());
        let (cb, rx) = callback();
        b.coordinator
            .start_migration(MigrationPlan::new(2, BITS), MigrationKind::Rebalance, false, cb)
            .unwrap();
        finished(rx).await.unwrap();
        assert_eq!(b.coordinator.state(), MigrationState::Idle);
        assert_eq!(b.coordinator.executor_count(), 0);
    }

    #[tokio::test]
    async fn test_window_bounds_parallel_shards() {
        let gated = GatedStore::new(0);
        let (_network, a, b) = pair(config().with_parallelism(2), gated.clone());
        a.coordinator.notify_ownership_update(table(1, &[A], &[]));
        fill(&a.store, 1..=4, 2);

        let (cb, mut rx) = callback();
        let plan = MigrationPlan::new(2, BITS).with_tokens(A, 1..=4);
        b.coordinator
            .start_migration(plan, MigrationKind::Rebalance, false, cb)
            .unwrap();

        eventually(|| gated.calls().len() == 2).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(gated.calls(), vec![1, 2]);

        // Shard 1 finishes round 1, which admits shard 3.
        gated.gate.add_permits(1);
        eventually(|| gated.calls().len() == 3).await;
        assert_eq!(gated.calls()[2], 3);
        assert!(rx.try_recv().is_err());

        gated.gate.add_permits(16);
        finished(rx).await.unwrap();
        assert_eq!(gated.calls().len(), 4);
        assert_eq!(b.store.inner.live_objects().len(), 8);
    }

    #[tokio::test]
    async fn test_abort_drains_and_allows_restart() {
        let gated = GatedStore::new(0);
        let (_network, a, b) = pair(config(), gated.clone());
        a.coordinator.notify_ownership_update(table(1, &[A], &[]));
        fill(&a.store, [1, 2], 2);

        let (cb, rx) = callback();
        let plan = MigrationPlan::new(2, BITS).with_tokens(A, [1]);
        b.coordinator
            .start_migration(plan, MigrationKind::Rebalance, false, cb)
            .unwrap();
        assert_eq!(b.coordinator.token_state(1), Some(FineTokenState::MigratingIn));

        b.coordinator.abort_migration(Error::Cancelled).await;
        b.coordinator.abort_migration(Error::Cancelled).await;
        assert!(matches!(finished(rx).await, Err(Error::Cancelled)));
        assert_eq!(b.coordinator.state(), MigrationState::Aborted);
        assert_eq!(b.coordinator.executor_count(), 0);
        assert_eq!(b.coordinator.target_version(), INVALID_VERSION);
        assert_eq!(b.coordinator.token_state(1), Some(FineTokenState::NotOwned));
        assert_eq!(b.coordinator.metrics().migrations_aborted.get("cancelled"), 1);

        gated.gate.add_permits(64);
        let (cb, rx) = callback();
        let plan = MigrationPlan::new(3, BITS).with_tokens(A, [2]);
        b.coordinator
            .start_migration(plan, MigrationKind::Rebalance, false, cb)
            .unwrap();
        finished(rx).await.unwrap();
        assert_eq!(b.store.inner.live_objects().len(), 2);
        assert_eq!(b.coordinator.token_state(2), Some(FineTokenState::Ready));
    }

    #[tokio::test]
    async fn test_source_pulling_same_token_declines() {
        let network = LocalNetwork::new();
        let a = add_node(&network, A, config(), GatedStore::new(0), Arc::new(AbortOnError));
        let b = add_node(&network, B, config(), GatedStore::open(), Arc::new(AbortOnError));
        a.coordinator.notify_ownership_update(table(1, &[A], &[]));
        fill(&a.store, [6], 2);

        // A is itself pulling token 6 from C; its snapshot never completes.
        let (a_cb, _a_rx) = callback();
        a.coordinator
            .start_migration(
                MigrationPlan::new(2, BITS).with_tokens(C, [6]),
                MigrationKind::Rebalance,
                false,
                a_cb,
            )
            .unwrap();

        let (cb, rx) = callback();
        b.coordinator
            .start_migration(
                MigrationPlan::new(2, BITS).with_tokens(A, [6]),
                MigrationKind::Rebalance,
                false,
                cb,
            )
            .unwrap();
        finished(rx).await.unwrap();

        assert_eq!(b.coordinator.token_state(6), Some(FineTokenState::Ready));
        assert!(b.store.inner.is_empty());
        assert_eq!(b.coordinator.metrics().snapshot().tokens_declined, 1);
        assert_eq!(a.coordinator.client_count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_resync_tie_break_follows_priority() {
        let network = LocalNetwork::new();
        let a = add_node(&network, A, config(), GatedStore::open(), Arc::new(AbortOnError));
        let b = add_node(&network, B, config(), GatedStore::open(), Arc::new(AbortOnError));
        let v1 = table(1, &[], &[(5, &[A, B])]);
        let only_on_a = object(5, 1);
        let only_on_b = object(5, 2);
        a.store.inner.put(only_on_a, 1, Bytes::from_static(b"a"));
        b.store.inner.put(only_on_b, 1, Bytes::from_static(b"b"));

        a.coordinator.start_resync(v1.clone()).unwrap();
        b.coordinator.start_resync(v1).unwrap();
        eventually(|| {
            a.coordinator.state() == MigrationState::Idle
                && b.coordinator.state() == MigrationState::Idle
        })
        .await;

        assert_eq!(
            b.store.inner.live_objects().keys().copied().collect::<BTreeSet<_>>(),
            BTreeSet::from([only_on_a, only_on_b])
        );
        assert_eq!(
            a.store.inner.live_objects().keys().copied().collect::<BTreeSet<_>>(),
            BTreeSet::from([only_on_a])
        );
        assert_eq!(a.coordinator.token_state(5), Some(FineTokenState::Ready));
        assert_eq!(b.coordinator.token_state(5), Some(FineTokenState::Ready));
        assert_eq!(a.coordinator.token_state(6), Some(FineTokenState::NotOwned));
        assert_eq!(a.coordinator.client_count(), 0);
        assert_eq!(b.coordinator.metrics().snapshot().resyncs_started, 1);
    }

    #[tokio::test]
    async fn test_resync_token_without_peer_is_ready() {
        let (_network, a, _b) = pair(config(), GatedStore::open());
        a.coordinator
            .start_resync(table(4, &[], &[(9, &[A])]))
            .unwrap();
        assert_eq!(a.coordinator.token_state(9), Some(FineTokenState::Ready));
        assert_eq!(a.coordinator.state(), MigrationState::Idle);
    }

    #[tokio::test]
    async fn test_forwarding_during_migration() {
        let (_network, a, b) = pair(config(), GatedStore::open());
        let v1 = table(1, &[A], &[]);
        a.coordinator.notify_ownership_update(v1.clone());
        b.coordinator.notify_ownership_update(v1);
        fill(&a.store, [1, 5], 1);

        let (cb, rx) = callback();
        b.coordinator
            .start_migration(
                MigrationPlan::new(2, BITS).with_tokens(A, [1]),
                MigrationKind::Rebalance,
                false,
                cb,
            )
            .unwrap();
        finished(rx).await.unwrap();

        let live = object(1, 9);
        let put = IoRequest::PutObject {
            object_id: live,
            volume: 1,
            data: Bytes::from_static(b"live"),
        };
        assert!(!a.coordinator.forward_if_needed(&live, 2, &put));
        assert!(a.coordinator.forward_if_needed(&live, 1, &put));
        let elsewhere = object(5, 9);
        assert!(!a.coordinator.forward_if_needed(&elsewhere, 1, &put));
        eventually(|| b.store.inner.metadata(&live).is_some()).await;

        let refs = IoRequest::AddObjectRef {
            src_volume: 1,
            dst_volume: 7,
            object_ids: vec![object(1, 0), object(5, 0)],
        };
        assert!(a.coordinator.forward_if_needed(&object(1, 0), 1, &refs));
        eventually(|| {
            b.store
                .inner
                .metadata(&object(1, 0))
                .is_some_and(|m| m.volume_refs.contains_key(&7))
        })
        .await;
        assert!(b.store.inner.metadata(&object(5, 0)).is_none());
        assert_eq!(a.coordinator.metrics().snapshot().forwarded_requests, 2);

        a.coordinator
            .on_ownership_table_closed(table(2, &[A], &[(1, &[B])]))
            .await
            .unwrap();
        assert!(!a.coordinator.forward_if_needed(&live, 1, &put));
    }

    #[tokio::test]
    async fn test_unreachable_source_aborts_rebalance() {
        let (network, a, b) = pair(config(), GatedStore::open());
        network.disconnect(a.coordinator.node_id());

        let (cb, rx) = callback();
        b.coordinator
            .start_migration(
                MigrationPlan::new(2, BITS).with_tokens(A, [3]),
                MigrationKind::Rebalance,
                false,
                cb,
            )
            .unwrap();
        let err = finished(rx).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(TransportError::SourceUnreachable(A))
        ));
        eventually(|| b.coordinator.executor_count() == 0).await;
        assert_eq!(b.coordinator.state(), MigrationState::Aborted);
        assert_eq!(b.coordinator.token_state(3), Some(FineTokenState::NotOwned));
    }

    #[derive(Debug)]
    struct ReplaceWith(NodeId);

    impl ErrorPolicy for ReplaceWith {
        fn on_error(&self, error: &Error, kind: MigrationKind) -> FailureAction {
            AbortOnError.on_error(error, kind)
        }

        fn replace_source(&self, _: ShardId, _: NodeId, _: &BTreeSet<FineToken>) -> Option<NodeId> {
            Some(self.0)
        }
    }

    #[tokio::test]
    async fn test_resync_replaces_unreachable_source() {
        let network = LocalNetwork::new();
        let b = add_node(&network, B, config(), GatedStore::open(), Arc::new(ReplaceWith(C)));
        let c = add_node(&network, C, config(), GatedStore::open(), Arc::new(AbortOnError));
        let v1 = table(1, &[], &[(4, &[B, A, C])]);
        c.coordinator.notify_ownership_update(v1.clone());
        c.store.inner.put(object(4, 1), 1, Bytes::from_static(b"c"));

        b.coordinator.start_resync(v1).unwrap();
        eventually(|| {
            b.coordinator.state() == MigrationState::Idle
                && c.coordinator.state() == MigrationState::Idle
        })
        .await;

        assert!(b.store.inner.metadata(&object(4, 1)).is_some());
        assert_eq!(b.coordinator.token_state(4), Some(FineTokenState::Ready));
    }

    #[tokio::test]
    async fn test_skip_policy_leaves_tokens_migrating() {
        let network = LocalNetwork::new();
        let b = add_node(&network, B, config(), GatedStore::open(), Arc::new(SkipFailedTokens));

        let (cb, rx) = callback();
        b.coordinator
            .start_migration(
                MigrationPlan::new(2, BITS).with_tokens(A, [3]),
                MigrationKind::Rebalance,
                false,
                cb,
            )
            .unwrap();
        finished(rx).await.unwrap();
        assert_eq!(b.coordinator.token_state(3), Some(FineTokenState::MigratingIn));
        assert_eq!(b.coordinator.state(), MigrationState::InProgress);
    }

    #[tokio::test]
    async fn test_timeout_aborts() {
        let cfg = config().with_migration_timeout(Duration::from_millis(50));
        let (_network, _a, b) = pair(cfg, GatedStore::new(0));

        let (cb, rx) = callback();
        b.coordinator
            .start_migration(
                MigrationPlan::new(2, BITS).with_tokens(A, [3]),
                MigrationKind::Rebalance,
                false,
                cb,
            )
            .unwrap();
        assert!(matches!(finished(rx).await, Err(Error::Timeout)));
        assert_eq!(b.coordinator.state(), MigrationState::Aborted);
        assert_eq!(b.coordinator.metrics().migrations_aborted.get("timeout"), 1);
    }

    #[tokio::test]
    async fn test_busy_source_is_retried() {
        let network = LocalNetwork::new();
        let a = add_node(&network, A, config(), GatedStore::new(0), Arc::new(AbortOnError));
        let b = add_node(&network, B, config(), GatedStore::open(), Arc::new(AbortOnError));
        a.coordinator.notify_ownership_update(table(1, &[A], &[]));
        a.store.inner.put(object(2, 0), 1, Bytes::from_static(b"x"));

        // A migrates toward version 3 and cannot serve version 2 yet.
        let (a_cb, a_rx) = callback();
        a.coordinator
            .start_migration(
                MigrationPlan::new(3, BITS).with_tokens(C, [9]),
                MigrationKind::Rebalance,
                false,
                a_cb,
            )
            .unwrap();

        let (cb, rx) = callback();
        b.coordinator
            .start_migration(
                MigrationPlan::new(2, BITS).with_tokens(A, [2]),
                MigrationKind::Rebalance,
                false,
                cb,
            )
            .unwrap();
        eventually(|| b.coordinator.metrics().snapshot().source_not_ready_retries > 0).await;

        a.coordinator
            .on_ownership_table_closed(table(3, &[A], &[]))
            .await
            .unwrap();
        assert!(finished(a_rx).await.is_err());
        a.store.gate.add_permits(8);

        finished(rx).await.unwrap();
        assert!(b.store.inner.metadata(&object(2, 0)).is_some());
    }

    #[tokio::test]
    async fn test_routing_errors() {
        let (_network, a, b) = pair(config(), GatedStore::new(0));
        let stray = RebalanceDeltaSet {
            executor_id: 42,
            seq_num: 0,
            last_set: true,
            objects: vec![],
        };
        assert!(matches!(
            b.coordinator.on_delta_set_received(stray.clone()).await,
            Err(Error::Coordination(CoordinationError::Aborted(_)))
        ));

        let (cb, _rx) = callback();
        b.coordinator
            .start_migration(
                MigrationPlan::new(2, BITS).with_tokens(A, [1]),
                MigrationKind::Rebalance,
                false,
                cb,
            )
            .unwrap();
        assert!(matches!(
            b.coordinator.on_delta_set_received(stray).await,
            Err(Error::Coordination(CoordinationError::UnknownExecutor(42)))
        ));
        assert!(matches!(
            a.coordinator
                .start_second_object_rebalance(SecondRebalanceRequest { executor_id: 42 }, B),
            Err(Error::Coordination(CoordinationError::UnknownExecutor(42)))
        ));
    }

    #[test]
    fn test_notify_initializes_token_states_once() {
        let network = LocalNetwork::new();
        let coordinator = MigrationCoordinator::new(
            A,
            config(),
            Arc::new(InMemoryObjectStore::new()),
            network.transport(A),
        );
        assert!(!coordinator.is_token_ready(&object(1, 0)));

        coordinator.notify_ownership_update(table(1, &[B], &[(1, &[A, B])]));
        assert!(coordinator.is_token_ready(&object(1, 0)));
        assert!(!coordinator.is_token_ready(&object(2, 0)));

        coordinator.notify_ownership_update(table(2, &[A], &[]));
        assert!(!coordinator.is_token_ready(&object(2, 0)));
    }

    #[test_log::test(tokio::test)]
    async fn test_source_snapshot_failure_aborts_destination() {
        let (_network, a, b) = pair(config(), GatedStore::open());
        a.coordinator.notify_ownership_update(table(1, &[A], &[]));
        fill(&a.store, [3], 2);
        a.store.gate.close();

        let (cb, rx) = callback();
        let plan = MigrationPlan::new(2, BITS).with_tokens(A, [3]);
        b.coordinator
            .start_migration(plan, MigrationKind::Rebalance, false, cb)
            .unwrap();

        // Fails well before the migration timeout.
        let err = finished(rx).await.unwrap_err();
        assert!(matches!(err, Error::Coordination(CoordinationError::Aborted(_))));
        assert_eq!(b.coordinator.state(), MigrationState::Aborted);
        assert_eq!(b.coordinator.token_state(3), Some(FineTokenState::NotOwned));
        assert!(b.store.inner.is_empty());

        eventually(|| a.coordinator.state() == MigrationState::Idle).await;
        assert_eq!(a.coordinator.client_count(), 0);
        assert_eq!(a.coordinator.target_version(), INVALID_VERSION);
    }

    #[tokio::test]
    async fn test_source_read_failure_aborts_destination() {
        let (_network, a, b) = pair(config(), GatedStore::open());
        a.coordinator.notify_ownership_update(table(1, &[A], &[]));
        fill(&a.store, [3], 2);
        a.store.fail_reads.store(true, Ordering::Release);

        let (cb, rx) = callback();
        let plan = MigrationPlan::new(2, BITS).with_tokens(A, [3]);
        b.coordinator
            .start_migration(plan, MigrationKind::Rebalance, false, cb)
            .unwrap();

        let err = finished(rx).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
        eventually(|| a.coordinator.state() == MigrationState::Idle).await;
        assert_eq!(a.coordinator.client_count(), 0);
        assert!(b.store.inner.is_empty());

        // Both sides accept a new run once the source store recovers.
        a.store.fail_reads.store(false, Ordering::Release);
        let (cb, rx) = callback();
        let plan = MigrationPlan::new(2, BITS).with_tokens(A, [3]);
        b.coordinator
            .start_migration(plan, MigrationKind::Rebalance, false, cb)
            .unwrap();
        finished(rx).await.unwrap();
        assert_eq!(b.store.inner.live_objects().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_config_is_refused() {
        let (_network, _a, b) = pair(config().with_parallelism(0), GatedStore::open());
        let (cb, rx) = callback();
        let plan = MigrationPlan::new(2, BITS).with_tokens(A, [3]);
        let err = b
            .coordinator
            .start_migration(plan, MigrationKind::Rebalance, false, cb)
            .unwrap_err();

        assert!(matches!(err, Error::Config(_)));
        assert!(matches!(finished(rx).await, Err(Error::Config(_))));
        assert_eq!(b.coordinator.state(), MigrationState::Idle);
        assert_eq!(b.coordinator.executor_count(), 0);
    }
}
