//! Destination side of a shard migration.
//!
//! One executor pulls a set of fine tokens of one shard from one source node.
//!
//! ```text
//!  Init ──start_round1──▶ Round1Filtering ──filters sent──▶ Round1ApplyingDeltas
//!                              ▲    │                              │ last delta set
//!                     NotReady │    │ one-phase                    ▼
//!                              └────┤                        Round2Requested
//!                                   │                              │ start_round2
//!                                   ▼                              ▼
//!                         Round2ApplyingDeltas ◀───────────────────┘
//!                                   │ last delta set
//!                                   ▼
//!                                 Done            (any failure ──▶ Error)
//! ```

use super::io_tracker::IoTracker;
use super::messages::{MetadataSnapshot, RebalanceDeltaSet, RebalanceFilterSet, SecondRebalanceRequest, SourceResponse};
use super::store::ObjectStore;
use super::transport::RebalanceTransport;
use crate::error::{CoordinationError, Error, Result};
use crate::metrics::MigrationMetrics;
use crate::types::{fine_token, ExecutorId, FineToken, NodeId, OwnershipVersion, ShardId};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Executor progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ExecutorState {
    Init = 0,
    Round1Filtering = 1,
    Round1ApplyingDeltas = 2,
    Round2Requested = 3,
    Round2ApplyingDeltas = 4,
    Done = 5,
    Error = 6,
}

impl ExecutorState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Init,
            1 => Self::Round1Filtering,
            2 => Self::Round1ApplyingDeltas,
            3 => Self::Round2Requested,
            4 => Self::Round2ApplyingDeltas,
            5 => Self::Done,
            _ => Self::Error,
        }
    }
}

/// Protocol round a report refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationRound {
    /// Per-token filter exchange.
    Filter,
    /// Bulk copy against snapshot 1.
    First,
    /// Catch-up diff against snapshot 2.
    Second,
}

/// How a round ended for one executor.
#[derive(Debug)]
pub enum RoundOutcome {
    Completed,
    /// The source declined the report's tokens.
    SourceDeclined,
    /// The source is busy with another target; retry the shard later.
    SourceNotReady,
    Failed(Error),
}

/// Sent to the coordinator whenever an executor finishes a round.
#[derive(Debug)]
pub struct RoundReport {
    pub executor_id: ExecutorId,
    pub shard: ShardId,
    pub source: NodeId,
    pub round: MigrationRound,
    pub outcome: RoundOutcome,
    /// Tokens the outcome applies to.
    pub tokens: BTreeSet<FineToken>,
}

/// Receives executor reports.
pub type ReportSink = Arc<dyn Fn(RoundReport) + Send + Sync>;

#[derive(Debug, Default)]
struct SeqTracker {
    last: Option<u64>,
    seen: BTreeSet<u64>,
    complete: bool,
}

impl SeqTracker {
    /// Record one delta set. Returns true exactly once, when the last set and
    /// every sequence number before it have arrived.
    fn record(&mut self, seq: u64, last: bool) -> bool {
        if self.complete {
            return false;
        }
        self.seen.insert(seq);
        if last {
            self.last = Some(seq);
        }
        match self.last {
            Some(last) if self.seen.len() as u64 == last + 1 && self.seen.iter().all(|s| *s <= last) => {
                self.complete = true;
                true
            }
            _ => false,
        }
    }
}

/// Identity and parameters of a new executor.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorParams {
    pub id: ExecutorId,
    pub shard: ShardId,
    pub source: NodeId,
    pub target_version: OwnershipVersion,
    pub token_bits: u32,
    pub one_phase: bool,
}

/// Pulls the fine tokens of one shard from one source.
pub struct MigrationExecutor {
    params: ExecutorParams,
    tokens: RwLock<BTreeSet<FineToken>>,
    state: AtomicU8,
    seq: Mutex<SeqTracker>,
    io: Arc<IoTracker>,
    store: Arc<dyn ObjectStore>,
    transport: Arc<dyn RebalanceTransport>,
    metrics: Arc<MigrationMetrics>,
    report: ReportSink,
}

impl fmt::Debug for MigrationExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationExecutor")
            .field("id", &format_args!("{:#x}", self.params.id))
            .field("shard", &self.params.shard)
            .field("source", &self.params.source)
            .field("state", &self.state())
            .field("tokens", &self.tokens.read().len())
            .finish()
    }
}

impl MigrationExecutor {
    pub fn new(
        params: ExecutorParams,
        store: Arc<dyn ObjectStore>,
        transport: Arc<dyn RebalanceTransport>,
        metrics: Arc<MigrationMetrics>,
        report: ReportSink,
    ) -> Self {
        Self {
            params,
            tokens: RwLock::new(BTreeSet::new()),
            state: AtomicU8::new(ExecutorState::Init as u8),
            seq: Mutex::new(SeqTracker::default()),
            io: IoTracker::new(),
            store,
            transport,
            metrics,
            report,
        }
    }

    pub fn id(&self) -> ExecutorId {
        self.params.id
    }

    pub fn shard(&self) -> ShardId {
        self.params.shard
    }

    pub fn source(&self) -> NodeId {
        self.params.source
    }

    pub fn state(&self) -> ExecutorState {
        ExecutorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ExecutorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: ExecutorState, to: ExecutorState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn add_token(&self, token: FineToken) {
        self.tokens.write().insert(token);
    }

    pub fn tokens(&self) -> BTreeSet<FineToken> {
        self.tokens.read().clone()
    }

    /// Whether this executor is pulling `token`.
    pub fn responsible_for(&self, token: FineToken) -> bool {
        self.tokens.read().contains(&token)
    }

    pub fn is_done(&self) -> bool {
        self.state() == ExecutorState::Done
    }

    pub fn in_error(&self) -> bool {
        self.state() == ExecutorState::Error
    }

    /// Whether the executor has nothing left to do for `round`.
    pub fn is_round_done(&self, round: MigrationRound) -> bool {
        let state = self.state();
        match round {
            MigrationRound::Filter => state >= ExecutorState::Round1ApplyingDeltas,
            MigrationRound::First => state >= ExecutorState::Round2Requested,
            MigrationRound::Second => state >= ExecutorState::Done,
        }
    }

    fn emit(&self, round: MigrationRound, outcome: RoundOutcome, tokens: BTreeSet<FineToken>) {
        (self.report)(RoundReport {
            executor_id: self.params.id,
            shard: self.params.shard,
            source: self.params.source,
            round,
            outcome,
            tokens,
        });
    }

    /// Send one filter set per token, built from the shard snapshot.
    ///
    /// Only runs from `Init`, or from `Round1Filtering` when the source was
    /// not ready before.
    pub async fn start_round1(&self, snapshot: &MetadataSnapshot) {
        let state = self.state();
        if !matches!(state, ExecutorState::Init | ExecutorState::Round1Filtering) {
            tracing::debug!(executor_id = self.params.id, ?state, "Round 1 already under way");
            return;
        }

        let tokens: Vec<FineToken> = self.tokens.read().iter().copied().collect();
        if tokens.is_empty() {
            self.finish_filtering();
            return;
        }

        let mut filters: BTreeMap<FineToken, BTreeMap<_, u64>> = BTreeMap::new();
        for (id, meta) in snapshot {
            if meta.ref_count == 0 {
                continue;
            }
            filters
                .entry(fine_token(id, self.params.token_bits))
                .or_default()
                .insert(*id, meta.ref_count);
        }

        *self.seq.lock() = SeqTracker::default();
        self.set_state(if self.params.one_phase {
            ExecutorState::Round2ApplyingDeltas
        } else {
            ExecutorState::Round1ApplyingDeltas
        });

        let round = self.active_round();
        let count = tokens.len();
        for (i, token) in tokens.into_iter().enumerate() {
            let filter_set = RebalanceFilterSet {
                executor_id: self.params.id,
                shard: self.params.shard,
                token,
                objects: filters.remove(&token).unwrap_or_default(),
                seq_num: i as u64,
                last_set: i + 1 == count,
                one_phase: self.params.one_phase,
                target_version: self.params.target_version,
            };
            self.metrics.filter_sets_sent.inc();
            match self
                .transport
                .send_filter_set(self.params.source, filter_set)
                .await
            {
                Ok(SourceResponse::Accepted) => {}
                Ok(SourceResponse::Declined) => {
                    self.tokens.write().remove(&token);
                    self.metrics.tokens_declined.inc();
                    tracing::debug!(shard = self.params.shard, token, source = self.params.source, "Source declined token");
                    self.emit(
                        MigrationRound::Filter,
                        RoundOutcome::SourceDeclined,
                        BTreeSet::from([token]),
                    );
                }
                Ok(SourceResponse::NotReady) => {
                    self.set_state(ExecutorState::Round1Filtering);
                    self.emit(round, RoundOutcome::SourceNotReady, self.tokens());
                    return;
                }
                Err(e) => {
                    self.fail(round, e);
                    return;
                }
            }
        }

        if self.tokens.read().is_empty() {
            self.finish_filtering();
        }
    }

    /// Every token was declined: the executor has nothing to pull.
    fn finish_filtering(&self) {
        if self.params.one_phase {
            self.set_state(ExecutorState::Done);
            self.emit(MigrationRound::Second, RoundOutcome::Completed, BTreeSet::new());
        } else {
            self.set_state(ExecutorState::Round2Requested);
            self.emit(MigrationRound::First, RoundOutcome::Completed, BTreeSet::new());
        }
    }

    fn active_round(&self) -> MigrationRound {
        if self.params.one_phase {
            MigrationRound::Second
        } else {
            MigrationRound::First
        }
    }

    /// Ask the source for the second round.
    pub async fn start_round2(&self) {
        if self.in_error() {
            return;
        }
        if self.tokens.read().is_empty() {
            if self.transition(ExecutorState::Round2Requested, ExecutorState::Done) {
                self.emit(MigrationRound::Second, RoundOutcome::Completed, BTreeSet::new());
            }
            return;
        }

        *self.seq.lock() = SeqTracker::default();
        if !self.transition(
            ExecutorState::Round2Requested,
            ExecutorState::Round2ApplyingDeltas,
        ) {
            tracing::warn!(executor_id = self.params.id, state = ?self.state(), "Round 2 requested in wrong state");
            return;
        }

        let request = SecondRebalanceRequest {
            executor_id: self.params.id,
        };
        if let Err(e) = self
            .transport
            .send_second_rebalance_request(self.params.source, request)
            .await
        {
            self.fail(MigrationRound::Second, e);
        }
    }

    /// Apply one delta set from the source.
    pub async fn apply_delta_set(&self, delta_set: &RebalanceDeltaSet) -> Result<()> {
        let Some(_guard) = self.io.start() else {
            return Err(CoordinationError::Aborted("executor is draining".into()).into());
        };

        let state = self.state();
        let round = match state {
            ExecutorState::Round1ApplyingDeltas => MigrationRound::First,
            ExecutorState::Round2ApplyingDeltas => MigrationRound::Second,
            ExecutorState::Error => {
                return Err(CoordinationError::TaskInError(self.params.id).into())
            }
            other => {
                return Err(CoordinationError::Protocol(format!(
                    "delta set {} for executor {:#x} in state {:?}",
                    delta_set.seq_num, self.params.id, other
                ))
                .into())
            }
        };

        if delta_set.objects.is_empty() && !delta_set.last_set {
            let err = CoordinationError::Protocol(format!(
                "empty delta set {} is not the last",
                delta_set.seq_num
            ));
            self.fail(round, err.clone().into());
            return Err(err.into());
        }

        for object in &delta_set.objects {
            if let Err(e) = self.store.apply_delta_object(object).await {
                let returned = e.duplicate();
                self.fail(round, e);
                return Err(returned);
            }
        }
        self.metrics.delta_sets_applied.inc();
        self.metrics
            .objects_applied
            .inc_by(delta_set.objects.len() as u64);

        let complete = self.seq.lock().record(delta_set.seq_num, delta_set.last_set);
        if complete {
            self.finish_round(state);
        }
        Ok(())
    }

    fn finish_round(&self, from: ExecutorState) {
        match from {
            ExecutorState::Round1ApplyingDeltas => {
                if self.transition(from, ExecutorState::Round2Requested) {
                    tracing::debug!(shard = self.params.shard, source = self.params.source, "Round 1 complete");
                    self.emit(MigrationRound::First, RoundOutcome::Completed, self.tokens());
                }
            }
            ExecutorState::Round2ApplyingDeltas => {
                if self.transition(from, ExecutorState::Done) {
                    tracing::debug!(shard = self.params.shard, source = self.params.source, "Round 2 complete");
                    self.emit(MigrationRound::Second, RoundOutcome::Completed, self.tokens());
                    if self.params.one_phase {
                        self.send_finish_resync();
                    }
                }
            }
            _ => {}
        }
    }

    fn send_finish_resync(&self) {
        let transport = Arc::clone(&self.transport);
        let source = self.params.source;
        let id = self.params.id;
        tokio::spawn(async move {
            if let Err(e) = transport.send_finish_resync(source, id).await {
                tracing::warn!(source, executor_id = id, error = %e, "Failed to finish resync at source");
            }
        });
    }

    fn fail(&self, round: MigrationRound, error: Error) {
        let prev = self.state.swap(ExecutorState::Error as u8, Ordering::AcqRel);
        if prev == ExecutorState::Error as u8 {
            return;
        }
        tracing::warn!(shard = self.params.shard, source = self.params.source, ?round, error = %error, "Executor failed");
        if self.params.one_phase {
            self.send_finish_resync();
        }
        self.emit(round, RoundOutcome::Failed(error), self.tokens());
    }

    /// The source stopped serving this executor. Fails the round in flight.
    pub fn abort_from_source(&self, reason: &str) {
        let round = match self.state() {
            ExecutorState::Done | ExecutorState::Error => return,
            _ if self.params.one_phase => MigrationRound::Second,
            ExecutorState::Round2Requested | ExecutorState::Round2ApplyingDeltas => {
                MigrationRound::Second
            }
            _ => MigrationRound::First,
        };
        let error = CoordinationError::Aborted(format!(
            "source {:#x} gave up: {}",
            self.params.source, reason
        ));
        self.fail(round, error.into());
    }

    /// Stop without reporting.
    pub fn cancel(&self) {
        if !self.is_done() {
            self.set_state(ExecutorState::Error);
        }
    }

    /// Wait until no delta set is being applied. New ones are refused.
    pub async fn wait_for_io_completion(&self) {
        self.io.drain().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::migration::messages::{DeltaObject, DeltaPayload, ForwardedRequest, ObjectMetadata};
    use crate::migration::store::InMemoryObjectStore;
    use crate::types::ObjectId;
    use async_trait::async_trait;
    use bytes::Bytes;

    /// Scripted source: answers filter sets from a queue and records traffic.
    #[derive(Debug, Default)]
    struct ScriptedSource {
        responses: Mutex<Vec<SourceResponse>>,
        filter_sets: Mutex<Vec<RebalanceFilterSet>>,
        second_requests: Mutex<Vec<SecondRebalanceRequest>>,
        finished: Mutex<Vec<ExecutorId>>,
        unreachable: bool,
    }

    #[async_trait]
    impl RebalanceTransport for ScriptedSource {
        async fn send_filter_set(
            &self,
            source: NodeId,
            filter_set: RebalanceFilterSet,
        ) -> Result<SourceResponse> {
            if self.unreachable {
                return Err(TransportError::SourceUnreachable(source).into());
            }
            self.filter_sets.lock().push(filter_set);
            let mut responses = self.responses.lock();
            Ok(if responses.is_empty() {
                SourceResponse::Accepted
            } else {
                responses.remove(0)
            })
        }

        async fn send_second_rebalance_request(
            &self,
            _source: NodeId,
            request: SecondRebalanceRequest,
        ) -> Result<()> {
            self.second_requests.lock().push(request);
            Ok(())
        }

        async fn send_delta_set(&self, _: NodeId, _: RebalanceDeltaSet) -> Result<()> {
            Ok(())
        }

        async fn send_finish_resync(&self, _: NodeId, executor_id: ExecutorId) -> Result<()> {
            self.finished.lock().push(executor_id);
            Ok(())
        }

        async fn send_migration_abort(&self, _: NodeId, _: ExecutorId, _: String) -> Result<()> {
            Ok(())
        }

        fn forward(&self, _: NodeId, _: ForwardedRequest) -> Result<()> {
            Ok(())
        }
    }

    struct Harness {
        executor: Arc<MigrationExecutor>,
        source: Arc<ScriptedSource>,
        store: Arc<InMemoryObjectStore>,
        reports: Arc<Mutex<Vec<RoundReport>>>,
    }

    fn harness(one_phase: bool, tokens: &[FineToken], source: ScriptedSource) -> Harness {
        let store = Arc::new(InMemoryObjectStore::new());
        let source = Arc::new(source);
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink: ReportSink = {
            let reports = Arc::clone(&reports);
            Arc::new(move |r: RoundReport| reports.lock().push(r))
        };
        let executor = Arc::new(MigrationExecutor::new(
            ExecutorParams {
                id: 0x1_0000_0001,
                shard: 3,
                source: 9,
                target_version: 2,
                token_bits: TOKEN_BITS,
                one_phase,
            },
            store.clone(),
            source.clone(),
            Arc::new(MigrationMetrics::new()),
            sink,
        ));
        for t in tokens {
            executor.add_token(*t);
        }
        Harness {
            executor,
            source,
            store,
            reports,
        }
    }

    const TOKEN_BITS: u32 = 10;

    fn object_in_token(token: FineToken, n: u8) -> ObjectId {
        let mut raw = [0u8; 16];
        raw[..8].copy_from_slice(&(u64::from(token) << (64 - TOKEN_BITS)).to_be_bytes());
        raw[15] = n;
        ObjectId::from_bytes(raw)
    }

    fn full(id: ObjectId) -> DeltaObject {
        DeltaObject {
            object_id: id,
            payload: DeltaPayload::Full {
                metadata: ObjectMetadata::new(4, 1),
                data: Bytes::from_static(b"data"),
            },
        }
    }

    fn delta_set(seq: u64, last: bool, objects: Vec<DeltaObject>) -> RebalanceDeltaSet {
        RebalanceDeltaSet {
            executor_id: 0x1_0000_0001,
            seq_num: seq,
            last_set: last,
            objects,
        }
    }

    #[tokio::test]
    async fn test_filter_sets_per_token() {
        let h = harness(false, &[3, 0x103], ScriptedSource::default());
        let mut snapshot = MetadataSnapshot::new();
        snapshot.insert(object_in_token(3, 1), ObjectMetadata::new(4, 1));
        let mut dead = ObjectMetadata::new(4, 1);
        dead.ref_count = 0;
        snapshot.insert(object_in_token(3, 2), dead);

        h.executor.start_round1(&snapshot).await;

        let sent = h.source.filter_sets.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!((sent[0].token, sent[0].seq_num, sent[0].last_set), (3, 0, false));
        assert_eq!((sent[1].token, sent[1].seq_num, sent[1].last_set), (0x103, 1, true));
        assert_eq!(sent[0].objects.len(), 1);
        assert!(sent[1].objects.is_empty());
        assert_eq!(h.executor.state(), ExecutorState::Round1ApplyingDeltas);
    }

    #[tokio::test]
    async fn test_round_completes_only_with_all_sequences() {
        let h = harness(false, &[3], ScriptedSource::default());
        h.executor.start_round1(&MetadataSnapshot::new()).await;

        let a = object_in_token(3, 1);
        let b = object_in_token(3, 2);
        h.executor
            .apply_delta_set(&delta_set(2, true, vec![]))
            .await
            .unwrap();
        h.executor
            .apply_delta_set(&delta_set(0, false, vec![full(a)]))
            .await
            .unwrap();
        assert!(!h.executor.is_round_done(MigrationRound::First));
        assert!(h.reports.lock().is_empty());

        h.executor
            .apply_delta_set(&delta_set(1, false, vec![full(b)]))
            .await
            .unwrap();
        assert!(h.executor.is_round_done(MigrationRound::First));
        assert_eq!(h.store.len(), 2);

        let reports = h.reports.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].round, MigrationRound::First);
        assert!(matches!(reports[0].outcome, RoundOutcome::Completed));
    }

    #[tokio::test]
    async fn test_second_round() {
        let h = harness(false, &[3], ScriptedSource::default());
        h.executor.start_round1(&MetadataSnapshot::new()).await;
        h.executor
            .apply_delta_set(&delta_set(0, true, vec![]))
            .await
            .unwrap();

        h.executor.start_round2().await;
        assert_eq!(h.executor.state(), ExecutorState::Round2ApplyingDeltas);
        assert_eq!(h.source.second_requests.lock().len(), 1);

        h.executor
            .apply_delta_set(&delta_set(0, true, vec![full(object_in_token(3, 7))]))
            .await
            .unwrap();
        assert!(h.executor.is_done());
        assert_eq!(h.reports.lock().last().unwrap().round, MigrationRound::Second);
        assert!(h.source.finished.lock().is_empty());
    }

    #[tokio::test]
    async fn test_empty_set_must_be_last() {
        let h = harness(false, &[3], ScriptedSource::default());
        h.executor.start_round1(&MetadataSnapshot::new()).await;

        let err = h
            .executor
            .apply_delta_set(&delta_set(0, false, vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Coordination(CoordinationError::Protocol(_))));
        assert!(h.executor.in_error());
        assert!(matches!(h.reports.lock()[0].outcome, RoundOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_declined_tokens() {
        let source = ScriptedSource {
            responses: Mutex::new(vec![SourceResponse::Declined, SourceResponse::Accepted]),
            ..Default::default()
        };
        let h = harness(false, &[3, 0x103], source);
        h.executor.start_round1(&MetadataSnapshot::new()).await;

        assert_eq!(h.executor.tokens(), BTreeSet::from([0x103]));
        let reports = h.reports.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].round, MigrationRound::Filter);
        assert!(matches!(reports[0].outcome, RoundOutcome::SourceDeclined));
        assert_eq!(reports[0].tokens, BTreeSet::from([3]));
    }

    #[tokio::test]
    async fn test_all_declined_one_phase_is_done() {
        let source = ScriptedSource {
            responses: Mutex::new(vec![SourceResponse::Declined]),
            ..Default::default()
        };
        let h = harness(true, &[3], source);
        h.executor.start_round1(&MetadataSnapshot::new()).await;

        assert!(h.executor.is_done());
        let reports = h.reports.lock();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].round, MigrationRound::Second);
        assert!(matches!(reports[1].outcome, RoundOutcome::Completed));
    }

    #[tokio::test]
    async fn test_not_ready_allows_retry() {
        let source = ScriptedSource {
            responses: Mutex::new(vec![SourceResponse::NotReady]),
            ..Default::default()
        };
        let h = harness(false, &[3], source);
        h.executor.start_round1(&MetadataSnapshot::new()).await;
        assert_eq!(h.executor.state(), ExecutorState::Round1Filtering);
        assert!(matches!(
            h.reports.lock()[0].outcome,
            RoundOutcome::SourceNotReady
        ));

        h.executor.start_round1(&MetadataSnapshot::new()).await;
        assert_eq!(h.executor.state(), ExecutorState::Round1ApplyingDeltas);
        assert_eq!(h.source.filter_sets.lock().len(), 2);

        // A running executor ignores further starts.
        h.executor.start_round1(&MetadataSnapshot::new()).await;
        assert_eq!(h.source.filter_sets.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_source_one_phase_fails() {
        let source = ScriptedSource {
            unreachable: true,
            ..Default::default()
        };
        let h = harness(true, &[3], source);
        h.executor.start_round1(&MetadataSnapshot::new()).await;
        tokio::task::yield_now().await;

        assert!(h.executor.in_error());
        assert!(h.executor.is_round_done(MigrationRound::Second));
        let reports = h.reports.lock();
        let RoundOutcome::Failed(err) = &reports[0].outcome else {
            panic!("expected failure");
        };
        assert!(err.is_source_unavailable());
        assert_eq!(*h.source.finished.lock(), vec![0x1_0000_0001]);
    }

    #[tokio::test]
    async fn test_cancel_refuses_deltas_after_drain() {
        let h = harness(false, &[3], ScriptedSource::default());
        h.executor.start_round1(&MetadataSnapshot::new()).await;
        h.executor.cancel();
        h.executor.wait_for_io_completion().await;

        assert!(h
            .executor
            .apply_delta_set(&delta_set(0, true, vec![]))
            .await
            .is_err());
        assert!(h.reports.lock().is_empty());
    }

    #[tokio::test]
    async fn test_source_abort_fails_active_round_once() {
        let h = harness(false, &[3], ScriptedSource::default());
        h.executor.start_round1(&MetadataSnapshot::new()).await;
        assert_eq!(h.executor.state(), ExecutorState::Round1ApplyingDeltas);

        h.executor.abort_from_source("snapshot failed");
        h.executor.abort_from_source("snapshot failed");

        assert!(h.executor.in_error());
        let reports = h.reports.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].round, MigrationRound::First);
        assert!(matches!(
            reports[0].outcome,
            RoundOutcome::Failed(Error::Coordination(CoordinationError::Aborted(_)))
        ));
    }

    #[tokio::test]
    async fn test_source_abort_after_done_is_ignored() {
        let h = harness(true, &[3], ScriptedSource::default());
        h.executor.start_round1(&MetadataSnapshot::new()).await;
        h.executor
            .apply_delta_set(&delta_set(0, true, vec![]))
            .await
            .unwrap();
        assert!(h.executor.is_done());

        h.executor.abort_from_source("late");
        assert!(h.executor.is_done());
        assert_eq!(h.reports.lock().len(), 1);
    }
}
