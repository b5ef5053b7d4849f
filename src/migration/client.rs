//! Source side of a shard migration.
//!
//! A client serves one remote executor. It collects the executor's filter
//! sets, sends everything the destination lacks (round 1), then the changes
//! since round 1 (round 2). Live requests for accepted tokens are mirrored to
//! the destination once forwarding is armed. A round that fails in the
//! background aborts the destination executor and is reported to the owner.

use super::io_tracker::IoTracker;
use super::messages::{
    DeltaObject, DeltaPayload, ForwardedRequest, IoRequest, MetadataSnapshot, RebalanceDeltaSet,
    RebalanceFilterSet,
};
use super::store::ObjectStore;
use super::transport::RebalanceTransport;
use crate::error::{CoordinationError, Error, Result};
use crate::metrics::MigrationMetrics;
use crate::types::{fine_token, ExecutorId, FineToken, NodeId, ObjectId, ShardId};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    Collecting = 0,
    Round1Sending = 1,
    Round1Complete = 2,
    Round2Sending = 3,
    Round2Complete = 4,
    Error = 5,
}

impl ClientState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Collecting,
            1 => Self::Round1Sending,
            2 => Self::Round1Complete,
            3 => Self::Round2Sending,
            4 => Self::Round2Complete,
            _ => Self::Error,
        }
    }
}

/// Result of handing a filter set to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSetOutcome {
    /// More filter sets are expected.
    Pending,
    /// All filter sets arrived; round 1 is being sent.
    Started,
    /// All filter sets arrived and every token was declined.
    AllDeclined,
}

#[derive(Debug, Default)]
struct FilterCollector {
    accepted: BTreeSet<FineToken>,
    objects: BTreeMap<ObjectId, u64>,
    seen: BTreeSet<u64>,
    last: Option<u64>,
}

impl FilterCollector {
    fn is_complete(&self) -> bool {
        matches!(self.last, Some(last) if self.seen.len() as u64 == last + 1)
    }
}

/// Identity and parameters of a new client.
#[derive(Debug, Clone, Copy)]
pub struct ClientParams {
    pub executor_id: ExecutorId,
    pub destination: NodeId,
    pub shard: ShardId,
    pub token_bits: u32,
    pub one_phase: bool,
    pub max_delta_set_size: usize,
}

/// Told the executor id of a client whose background round failed.
pub type ClientFailureSink = Arc<dyn Fn(ExecutorId) + Send + Sync>;

/// Serves one remote executor.
pub struct MigrationClient {
    params: ClientParams,
    state: AtomicU8,
    filters: Mutex<FilterCollector>,
    accepted: RwLock<BTreeSet<FineToken>>,
    forwarding: AtomicBool,
    seq: AtomicU64,
    snapshot1: Mutex<Option<MetadataSnapshot>>,
    io: Arc<IoTracker>,
    store: Arc<dyn ObjectStore>,
    transport: Arc<dyn RebalanceTransport>,
    metrics: Arc<MigrationMetrics>,
    on_failure: ClientFailureSink,
}

impl fmt::Debug for MigrationClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationClient")
            .field("executor_id", &format_args!("{:#x}", self.params.executor_id))
            .field("destination", &self.params.destination)
            .field("shard", &self.params.shard)
            .field("state", &self.state())
            .field("forwarding", &self.is_forwarding())
            .finish()
    }
}

impl MigrationClient {
    pub fn new(
        params: ClientParams,
        store: Arc<dyn ObjectStore>,
        transport: Arc<dyn RebalanceTransport>,
        metrics: Arc<MigrationMetrics>,
        on_failure: ClientFailureSink,
    ) -> Self {
        Self {
            params,
            state: AtomicU8::new(ClientState::Collecting as u8),
            filters: Mutex::new(FilterCollector::default()),
            accepted: RwLock::new(BTreeSet::new()),
            forwarding: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            snapshot1: Mutex::new(None),
            io: IoTracker::new(),
            store,
            transport,
            metrics,
            on_failure,
        }
    }

    pub fn executor_id(&self) -> ExecutorId {
        self.params.executor_id
    }

    pub fn destination(&self) -> NodeId {
        self.params.destination
    }

    pub fn shard(&self) -> ShardId {
        self.params.shard
    }

    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_forwarding(&self) -> bool {
        self.forwarding.load(Ordering::Acquire)
    }

    pub fn accepted_tokens(&self) -> BTreeSet<FineToken> {
        self.accepted.read().clone()
    }

    fn transition(&self, from: ClientState, to: ClientState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set_error(&self, error: &Error) {
        let prev = self.state.swap(ClientState::Error as u8, Ordering::AcqRel);
        self.forwarding.store(false, Ordering::Release);
        if prev != ClientState::Error as u8 {
            tracing::warn!(
                executor_id = self.params.executor_id,
                destination = self.params.destination,
                shard = self.params.shard,
                error = %error,
                "Migration client failed"
            );
        }
    }

    /// A background round failed: the destination executor would otherwise
    /// wait for delta sets until its migration times out.
    async fn abort(&self, error: Error) {
        self.set_error(&error);
        if let Err(e) = self
            .transport
            .send_migration_abort(
                self.params.destination,
                self.params.executor_id,
                error.to_string(),
            )
            .await
        {
            tracing::warn!(
                executor_id = self.params.executor_id,
                destination = self.params.destination,
                error = %e,
                "Failed to notify destination of client failure"
            );
        }
        (self.on_failure)(self.params.executor_id);
    }

    /// Record one filter set. After the last one, round 1 starts in the
    /// background.
    pub fn handle_filter_set(
        self: &Arc<Self>,
        filter_set: RebalanceFilterSet,
        accepted: bool,
    ) -> Result<FilterSetOutcome> {
        if self.state() == ClientState::Error {
            return Err(CoordinationError::TaskInError(self.params.executor_id).into());
        }
        if filter_set.shard != self.params.shard {
            let err = Error::from(CoordinationError::ExecutorMismatch {
                executor_id: self.params.executor_id,
                expected: self.params.shard,
                actual: filter_set.shard,
            });
            self.set_error(&err);
            return Err(err);
        }
        if self.state() != ClientState::Collecting {
            return Err(CoordinationError::Protocol(format!(
                "filter set {} after round 1 started",
                filter_set.seq_num
            ))
            .into());
        }

        let (tokens, filter) = {
            let mut collector = self.filters.lock();
            // The executor restarts from the first token after NotReady.
            if filter_set.seq_num == 0 {
                *collector = FilterCollector::default();
            }
            if accepted {
                collector.accepted.insert(filter_set.token);
                collector.objects.extend(filter_set.objects);
            }
            collector.seen.insert(filter_set.seq_num);
            if filter_set.last_set {
                collector.last = Some(filter_set.seq_num);
            }
            if !collector.is_complete() {
                return Ok(FilterSetOutcome::Pending);
            }
            let collected = std::mem::take(&mut *collector);
            (collected.accepted, collected.objects)
        };

        if tokens.is_empty() {
            return Ok(FilterSetOutcome::AllDeclined);
        }
        *self.accepted.write() = tokens;
        if !self.transition(ClientState::Collecting, ClientState::Round1Sending) {
            return Err(CoordinationError::TaskInError(self.params.executor_id).into());
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.run_first_phase(filter).await {
                this.abort(e).await;
            }
        });
        Ok(FilterSetOutcome::Started)
    }

    async fn accepted_snapshot(&self) -> Result<MetadataSnapshot> {
        self.metrics.snapshots_requested.inc();
        let mut snapshot = self
            .store
            .snapshot(self.params.shard, self.params.token_bits)
            .await?;
        let accepted = self.accepted.read().clone();
        snapshot.retain(|id, _| accepted.contains(&fine_token(id, self.params.token_bits)));
        Ok(snapshot)
    }

    async fn run_first_phase(&self, filter: BTreeMap<ObjectId, u64>) -> Result<()> {
        let Some(_guard) = self.io.start() else {
            return Ok(());
        };
        if self.params.one_phase {
            self.forwarding.store(true, Ordering::Release);
        }

        let snapshot = self.accepted_snapshot().await?;
        let mut batch = Vec::new();
        for (id, meta) in &snapshot {
            if meta.corrupted {
                continue;
            }
            let missing = match filter.get(id) {
                None => meta.ref_count > 0,
                Some(ref_count) => *ref_count != meta.ref_count,
            };
            if !missing {
                continue;
            }
            let data = self.store.read_object_data(id).await?;
            batch.push(DeltaObject {
                object_id: *id,
                payload: DeltaPayload::Full {
                    metadata: meta.clone(),
                    data,
                },
            });
            if batch.len() == self.params.max_delta_set_size {
                self.send_batch(std::mem::take(&mut batch), false).await?;
            }
        }

        // The destination may ask for round 2 as soon as the last set lands.
        *self.snapshot1.lock() = Some(snapshot);
        if self.transition(ClientState::Round1Sending, ClientState::Round1Complete) {
            tracing::debug!(
                executor_id = self.params.executor_id,
                shard = self.params.shard,
                "Round 1 sent"
            );
        }
        self.send_batch(batch, true).await
    }

    /// Start sending the changes made since round 1.
    pub fn start_second_phase(self: &Arc<Self>) -> Result<()> {
        match self.state() {
            ClientState::Error => {
                return Err(CoordinationError::TaskInError(self.params.executor_id).into())
            }
            ClientState::Round1Complete => {}
            other => {
                return Err(CoordinationError::Protocol(format!(
                    "second round requested in state {:?}",
                    other
                ))
                .into())
            }
        }
        if !self.transition(ClientState::Round1Complete, ClientState::Round2Sending) {
            return Err(CoordinationError::TaskInError(self.params.executor_id).into());
        }
        self.seq.store(0, Ordering::Release);
        self.forwarding.store(true, Ordering::Release);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.run_second_phase().await {
                this.abort(e).await;
            }
        });
        Ok(())
    }

    async fn run_second_phase(&self) -> Result<()> {
        let Some(_guard) = self.io.start() else {
            return Ok(());
        };
        let old = self.snapshot1.lock().take().unwrap_or_default();
        let new = self.accepted_snapshot().await?;

        let mut batch = Vec::new();
        for (id, meta) in &new {
            if meta.corrupted {
                continue;
            }
            let payload = match old.get(id) {
                None if meta.ref_count == 0 => continue,
                Some(prev) if prev == meta => continue,
                None => None,
                Some(prev) if prev.ref_count == 0 => None,
                Some(prev) => Some(meta.diff_from(prev)),
            };
            let payload = match payload {
                Some(diff) => diff,
                None => DeltaPayload::Full {
                    metadata: meta.clone(),
                    data: self.store.read_object_data(id).await?,
                },
            };
            batch.push(DeltaObject {
                object_id: *id,
                payload,
            });
            if batch.len() == self.params.max_delta_set_size {
                self.send_batch(std::mem::take(&mut batch), false).await?;
            }
        }

        if self.transition(ClientState::Round2Sending, ClientState::Round2Complete) {
            tracing::debug!(
                executor_id = self.params.executor_id,
                shard = self.params.shard,
                "Round 2 sent"
            );
        }
        self.send_batch(batch, true).await
    }

    async fn send_batch(&self, objects: Vec<DeltaObject>, last_set: bool) -> Result<()> {
        let count = objects.len() as u64;
        let delta_set = RebalanceDeltaSet {
            executor_id: self.params.executor_id,
            seq_num: self.seq.fetch_add(1, Ordering::AcqRel),
            last_set,
            objects,
        };
        self.transport
            .send_delta_set(self.params.destination, delta_set)
            .await?;
        self.metrics.delta_sets_sent.inc();
        self.metrics.objects_sent.inc_by(count);
        Ok(())
    }

    /// Mirror a live request for `token` to the destination. Returns whether
    /// it was forwarded.
    pub fn forward_if_needed(&self, token: FineToken, request: &IoRequest) -> bool {
        if !self.is_forwarding() || !self.accepted.read().contains(&token) {
            return false;
        }
        let Some(_guard) = self.io.start() else {
            return false;
        };
        let forwarded = ForwardedRequest {
            executor_id: self.params.executor_id,
            request: request.clone(),
        };
        match self.transport.forward(self.params.destination, forwarded) {
            Ok(()) => {
                self.metrics.forwarded_requests.inc();
                true
            }
            Err(e) => {
                self.set_error(&e);
                false
            }
        }
    }

    /// Stop forwarding and refuse new work.
    pub fn cancel(&self) {
        self.forwarding.store(false, Ordering::Release);
    }

    pub async fn wait_for_io_completion(&self) {
        self.io.drain().await;
    }
}
