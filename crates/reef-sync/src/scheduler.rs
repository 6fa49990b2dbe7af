//! [`SyncScheduler`] — drives hosted shards to their authoritative content.
//!
//! For every shard in the local registry the scheduler computes a deficit
//! against the on-chain metadata, range-syncs it from capable peers in
//! bounded concurrent batches, verifies every entry before persisting it,
//! and point-heals whatever peers failed to serve. Progress is published
//! on the completion feed; a watchdog cancels the sync context when no
//! progress arrives within the configured timeout.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use reef_net::{KV_PAYLOAD_OVERHEAD, KvPayload, NetError, SyncTransport};
use reef_store::encoding::{decode_kv, meta_of};
use reef_store::{ShardHandle, ShardRegistry};
use reef_types::events::{AllShardsDone, ShardSyncDone, SyncProgress, SyncStalled};
use reef_types::{Contract, EventBus, KvMeta, PeerId, SyncConfig};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::SyncError;
use crate::metadata::MetadataSource;
use crate::peers::PeerShardDirectory;
use crate::progress::ProgressStore;
use crate::task::{SyncState, Task};

/// One dispatched unit of work against a single peer.
#[derive(Debug, Clone)]
enum Job {
    /// A window `[start, end)` of a subtask, identified by its `first`.
    Range {
        subtask_first: u64,
        start: u64,
        end: u64,
    },
    /// A batch of heal indices fetched by list request.
    Heal { indices: Vec<u64> },
}

/// The result of one in-flight batch.
struct BatchOutcome {
    job: Job,
    peer: PeerId,
    result: Result<Vec<KvPayload>, NetError>,
}

/// Result of one metadata scan over a shard.
#[derive(Default)]
struct ShardScan {
    /// Indices needing fetch, ascending, each with a known meta.
    deficit: Vec<u64>,
    /// Authoritative metas for the deficit indices.
    metas: HashMap<u64, KvMeta>,
    /// Below-watermark indices the metadata source could not answer.
    missing_meta: u64,
    /// Above-watermark entries written with the empty pattern this scan.
    empties_filled: u64,
}

/// The client-side sync engine.
pub struct SyncScheduler {
    registry: Arc<ShardRegistry>,
    peers: Arc<PeerShardDirectory>,
    metadata: Arc<dyn MetadataSource>,
    transport: Arc<dyn SyncTransport>,
    progress: Arc<ProgressStore>,
    events: EventBus,
    config: SyncConfig,
    /// Cooperative cancellation, observed at request-issue time and
    /// between batches. In-flight requests are allowed to complete.
    cancel_tx: watch::Sender<bool>,
    /// Live view of per-shard sync state, canonically keyed.
    tasks: Mutex<BTreeMap<(Contract, u64), Task>>,
    /// Round-robin cursor over capable peers.
    peer_cursor: AtomicUsize,
    all_done_emitted: AtomicBool,
}

impl SyncScheduler {
    /// Create a scheduler over the given components.
    pub fn new(
        registry: Arc<ShardRegistry>,
        peers: Arc<PeerShardDirectory>,
        metadata: Arc<dyn MetadataSource>,
        transport: Arc<dyn SyncTransport>,
        progress: Arc<ProgressStore>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let (cancel_tx, _) = watch::channel(false);
        Arc::new(Self {
            registry,
            peers,
            metadata,
            transport,
            progress,
            events: EventBus::new(),
            config,
            cancel_tx,
            tasks: Mutex::new(BTreeMap::new()),
            peer_cursor: AtomicUsize::new(0),
            all_done_emitted: AtomicBool::new(false),
        })
    }

    /// The completion feed: progress, shard-done, all-done, stall events.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Cancel the sync context. No new requests are issued afterwards.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Whether the sync context has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Current state of a shard's task, if one has been created.
    pub fn task(&self, contract: Contract, shard_index: u64) -> Option<Task> {
        let tasks = self.tasks.lock().expect("task map lock poisoned");
        tasks.get(&(contract, shard_index)).cloned()
    }

    fn store_task(&self, task: &Task) {
        let mut tasks = self.tasks.lock().expect("task map lock poisoned");
        tasks.insert((task.contract, task.shard_index), task.clone());
    }

    // -------------------------------------------------------------------
    // Top level
    // -------------------------------------------------------------------

    /// Sync every hosted shard until done, stalled, or cancelled.
    pub async fn run(self: &Arc<Self>) -> Result<(), SyncError> {
        let hosted = self.registry.hosted();
        self.all_done_emitted.store(false, Ordering::SeqCst);

        if hosted.is_empty() {
            self.events.emit(AllShardsDone);
            return Ok(());
        }

        info!(shards = hosted.len(), "starting shard sync");
        let watchdog = tokio::spawn(Arc::clone(self).watchdog());

        let mut workers = JoinSet::new();
        for (contract, shard_index) in hosted {
            let this = Arc::clone(self);
            workers.spawn(async move { this.sync_shard(contract, shard_index).await });
        }

        let mut result = Ok(());
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "shard sync failed");
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
                Err(e) => error!(error = %e, "shard sync worker panicked"),
            }
        }

        watchdog.abort();
        result
    }

    /// Stall safety net: cancels the sync context when no progress event
    /// arrives within the configured timeout. This is a liveness backstop,
    /// not a correctness mechanism.
    async fn watchdog(self: Arc<Self>) {
        let timeout = self.config.stall_timeout();
        let mut progress_rx = self.events.subscribe::<SyncProgress>();
        let mut shard_done_rx = self.events.subscribe::<ShardSyncDone>();
        let mut all_done_rx = self.events.subscribe::<AllShardsDone>();
        let mut cancel_rx = self.cancel_tx.subscribe();

        loop {
            tokio::select! {
                event = progress_rx.recv() => {
                    if event.is_none() {
                        return;
                    }
                    // Progress observed; the timeout below starts over.
                }
                event = shard_done_rx.recv() => {
                    if event.is_none() {
                        return;
                    }
                }
                _ = all_done_rx.recv() => {
                    debug!("watchdog stopped: sync complete");
                    return;
                }
                _ = cancel_rx.changed() => return,
                _ = tokio::time::sleep(timeout) => {
                    warn!(
                        timeout_ms = self.config.stall_timeout_ms,
                        "sync stalled: no progress before timeout, cancelling"
                    );
                    self.events.emit(SyncStalled {
                        idle_ms: self.config.stall_timeout_ms,
                    });
                    self.cancel();
                    return;
                }
            }
        }
    }

    // -------------------------------------------------------------------
    // Per-shard sync
    // -------------------------------------------------------------------

    /// Sync one shard to its authoritative content.
    ///
    /// Returns once the shard is done or the context is cancelled.
    pub async fn sync_shard(&self, contract: Contract, shard_index: u64) -> Result<(), SyncError> {
        let shard = self
            .registry
            .get(contract, shard_index)
            .ok_or(SyncError::ShardNotRegistered {
                contract,
                shard_index,
            })?;

        // Fast path: a finished snapshot over complete storage means no
        // metadata queries and no peer requests at all.
        let mut heal_seed: BTreeSet<u64> = BTreeSet::new();
        match self.progress.load(contract, shard_index) {
            Ok(Some(snapshot)) if snapshot.done && shard.is_complete() => {
                debug!(%contract, shard = shard_index, "shard already synced");
                let mut task = Task::new(contract, shard_index);
                task.update_state();
                self.store_task(&task);
                self.events.emit(ShardSyncDone {
                    contract,
                    shard_index,
                });
                self.finish_if_all_done();
                return Ok(());
            }
            Ok(Some(snapshot)) => {
                // Carry heal entries across restarts; subtask ranges are
                // rebuilt from a fresh scan so stale entries resurface.
                heal_seed.extend(snapshot.heal);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to load sync snapshot"),
        }

        let mut cancel_rx = self.cancel_tx.subscribe();

        loop {
            if self.is_cancelled() {
                return Ok(());
            }

            let scan = match self.scan_shard(&shard, contract, shard_index).await {
                Ok(scan) => scan,
                Err(e) => {
                    warn!(
                        %contract, shard = shard_index, error = %e,
                        "metadata scan failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.retry_delay()) => {}
                        _ = cancel_rx.changed() => {}
                    }
                    continue;
                }
            };

            if scan.empties_filled > 0 {
                self.events.emit(SyncProgress {
                    contract,
                    shard_index,
                    delta: scan.empties_filled,
                });
            }

            let mut task = Task::new(contract, shard_index);
            // Heal entries can only be fetched with a known meta; the rest
            // stay deficit and come back on a later scan.
            for idx in &heal_seed {
                if scan.metas.contains_key(idx) {
                    task.heal.indices.insert(*idx);
                }
            }
            heal_seed.clear();

            if scan.deficit.is_empty() && scan.missing_meta == 0 && task.heal.is_empty() {
                task.update_state();
                self.store_task(&task);
                if let Err(e) = self.progress.save(contract, shard_index, &task.snapshot()) {
                    warn!(error = %e, "failed to persist sync snapshot");
                }
                info!(%contract, shard = shard_index, "shard sync complete");
                self.events.emit(ShardSyncDone {
                    contract,
                    shard_index,
                });
                self.finish_if_all_done();
                return Ok(());
            }

            task.add_deficit(&scan.deficit);
            task.update_state();
            self.store_task(&task);

            if task.subtasks.is_empty() && task.heal.is_empty() {
                // Only unanswered metadata remains; nothing to dispatch yet.
                tokio::select! {
                    _ = tokio::time::sleep(self.config.retry_delay()) => {}
                    _ = cancel_rx.changed() => {}
                }
                continue;
            }

            info!(
                %contract,
                shard = shard_index,
                deficit = scan.deficit.len(),
                heal = task.heal.len(),
                missing_meta = scan.missing_meta,
                "shard deficit computed"
            );

            self.drive(&shard, &mut task, &scan.metas).await?;

            // Whatever the drive could not resolve (cancellation) seeds
            // the next pass; the rescan re-verifies convergence.
            heal_seed = task
                .heal
                .indices
                .iter()
                .chain(task.heal.in_flight.iter())
                .copied()
                .collect();
        }
    }

    /// Query the watermark and metas, fill empties, compute the deficit.
    async fn scan_shard(
        &self,
        shard: &ShardHandle,
        contract: Contract,
        shard_index: u64,
    ) -> Result<ShardScan, SyncError> {
        let range = shard.kv_range();
        let watermark = self.metadata.get_last_kv_index(contract, None).await?;
        let mut scan = ShardScan::default();

        // Indices at or beyond the watermark are legitimately empty and
        // never requested from peers.
        for kv_idx in range.clone().filter(|&kv| kv >= watermark) {
            if shard.try_read_meta(kv_idx)? != Some(KvMeta::empty()) {
                shard.encode_and_write(kv_idx, &[], KvMeta::empty())?;
                scan.empties_filled += 1;
            }
        }

        let below: Vec<u64> = range.filter(|&kv| kv < watermark).collect();
        for batch in below.chunks(self.config.meta_batch_size.max(1)) {
            let answered: HashMap<u64, KvMeta> =
                match self.metadata.get_kv_metas(contract, batch, None).await {
                    Ok(pairs) => pairs.into_iter().collect(),
                    Err(e) => {
                        // A failing batch never aborts the shard; its
                        // indices stay deficit and are retried next pass.
                        warn!(
                            %contract, shard = shard_index, error = %e,
                            "metadata batch failed, deferring indices"
                        );
                        scan.missing_meta += batch.len() as u64;
                        continue;
                    }
                };

            for &kv_idx in batch {
                match answered.get(&kv_idx) {
                    Some(auth) if auth.is_filled() => {
                        let local = shard.try_read_meta(kv_idx)?;
                        if !local.is_some_and(|meta| meta.matches(auth)) {
                            scan.deficit.push(kv_idx);
                            scan.metas.insert(kv_idx, *auth);
                        }
                    }
                    _ => scan.missing_meta += 1,
                }
            }
        }

        Ok(scan)
    }

    // -------------------------------------------------------------------
    // Batch dispatch
    // -------------------------------------------------------------------

    /// Run range and heal batches until the task is done or cancelled.
    async fn drive(
        &self,
        shard: &ShardHandle,
        task: &mut Task,
        metas: &HashMap<u64, KvMeta>,
    ) -> Result<(), SyncError> {
        let contract = task.contract;
        let shard_index = task.shard_index;
        let kv_size = shard.config().kv_size;
        let batch_cap = (self.config.max_request_bytes / (kv_size + KV_PAYLOAD_OVERHEAD)).max(1);

        let mut inflight: JoinSet<BatchOutcome> = JoinSet::new();
        let mut cancel_rx = self.cancel_tx.subscribe();

        loop {
            // Dispatch while capacity and capable peers remain. Cancellation
            // is observed here: no new requests afterwards.
            if !self.is_cancelled() {
                let capable = self.peers.peers_for(contract, shard_index);
                if !capable.is_empty() {
                    while inflight.len() < self.config.max_concurrent_requests {
                        let Some(job) = Self::next_job(task, batch_cap) else {
                            break;
                        };
                        let peer = capable
                            [self.peer_cursor.fetch_add(1, Ordering::Relaxed) % capable.len()];
                        let transport = Arc::clone(&self.transport);
                        inflight.spawn(async move {
                            let result = match &job {
                                Job::Range { start, end, .. } => {
                                    transport
                                        .request_range(
                                            peer,
                                            contract,
                                            shard_index,
                                            *start,
                                            end - start,
                                        )
                                        .await
                                }
                                Job::Heal { indices } => {
                                    transport
                                        .request_list(
                                            peer,
                                            contract,
                                            shard_index,
                                            indices.clone(),
                                        )
                                        .await
                                }
                            };
                            BatchOutcome { job, peer, result }
                        });
                    }
                }
            }

            if inflight.is_empty() {
                if task.is_done() {
                    task.update_state();
                    self.store_task(task);
                    return Ok(());
                }
                if self.is_cancelled() {
                    debug!(%contract, shard = shard_index, "sync cancelled with work outstanding");
                    return Ok(());
                }
                // Deficit remains but nothing is dispatchable (no capable
                // peer). Wait for peers to arrive or the watchdog to fire.
                tokio::select! {
                    _ = tokio::time::sleep(self.config.retry_delay()) => {}
                    _ = cancel_rx.changed() => {}
                }
                continue;
            }

            // One response at a time: verification and storage writes are
            // synchronous CPU-bound work done after the suspension point.
            match inflight.join_next().await {
                Some(Ok(outcome)) => {
                    let failed = outcome.result.is_err();
                    let delta = self.apply_outcome(shard, task, metas, outcome);
                    task.update_state();
                    self.store_task(task);
                    if let Err(e) = self.progress.save(contract, shard_index, &task.snapshot()) {
                        warn!(error = %e, "failed to persist sync snapshot");
                    }
                    if delta > 0 {
                        self.events.emit(SyncProgress {
                            contract,
                            shard_index,
                            delta,
                        });
                    }
                    if failed || delta == 0 {
                        // A batch that resolved nothing (transport failure,
                        // absent entries, failed verification) defers before
                        // redispatch so retries never turn into a busy loop.
                        tokio::select! {
                            _ = tokio::time::sleep(self.config.retry_delay()) => {}
                            _ = cancel_rx.changed() => {}
                        }
                    }
                }
                Some(Err(e)) => error!(error = %e, "sync batch task panicked"),
                None => {}
            }
        }
    }

    /// Pick the next dispatchable unit of work, marking it in flight.
    ///
    /// An index is never covered by two outstanding requests: subtasks are
    /// flagged while a window is out, and heal indices move into the
    /// in-flight set as they are drained.
    fn next_job(task: &mut Task, batch_cap: u64) -> Option<Job> {
        for subtask in task.subtasks.iter_mut() {
            if !subtask.is_resolved() && !subtask.in_flight {
                subtask.in_flight = true;
                let end = subtask.last.min(subtask.next + batch_cap);
                return Some(Job::Range {
                    subtask_first: subtask.first,
                    start: subtask.next,
                    end,
                });
            }
        }
        if !task.heal.indices.is_empty() {
            return Some(Job::Heal {
                indices: task.heal.drain_batch(batch_cap as usize),
            });
        }
        None
    }

    /// Fold one batch outcome into the task. Returns the number of entries
    /// verified and written.
    fn apply_outcome(
        &self,
        shard: &ShardHandle,
        task: &mut Task,
        metas: &HashMap<u64, KvMeta>,
        outcome: BatchOutcome,
    ) -> u64 {
        let mut verified = 0u64;

        match outcome.job {
            Job::Range {
                subtask_first,
                start,
                end,
            } => {
                let payloads = match outcome.result {
                    Ok(payloads) => payloads,
                    Err(e) => {
                        // Transport failure: the window stays unfetched and
                        // is retried, typically against another peer.
                        warn!(
                            peer = %outcome.peer, start, end, error = %e,
                            "range request failed, deferring window"
                        );
                        if let Some(subtask) =
                            task.subtasks.iter_mut().find(|st| st.first == subtask_first)
                        {
                            subtask.in_flight = false;
                        }
                        return 0;
                    }
                };

                let by_idx: HashMap<u64, &KvPayload> = payloads
                    .iter()
                    .filter(|p| p.kv_idx >= start && p.kv_idx < end)
                    .map(|p| (p.kv_idx, p))
                    .collect();

                for kv_idx in start..end {
                    let Some(auth) = metas.get(&kv_idx) else {
                        continue;
                    };
                    let resolved = by_idx
                        .get(&kv_idx)
                        .is_some_and(|payload| self.verify_and_store(shard, kv_idx, payload, auth));
                    if resolved {
                        verified += 1;
                    } else {
                        // Absent or failed verification: redirected to the
                        // heal set, never silently dropped.
                        task.heal.indices.insert(kv_idx);
                    }
                }

                if let Some(subtask) =
                    task.subtasks.iter_mut().find(|st| st.first == subtask_first)
                {
                    subtask.in_flight = false;
                    // Monotonic: every index in the window is now either
                    // resolved or in the heal set.
                    subtask.next = subtask.next.max(end);
                }
            }
            Job::Heal { indices } => {
                let by_idx: HashMap<u64, &KvPayload> = match &outcome.result {
                    Ok(payloads) => payloads.iter().map(|p| (p.kv_idx, p)).collect(),
                    Err(e) => {
                        warn!(
                            peer = %outcome.peer, count = indices.len(), error = %e,
                            "list request failed, re-queueing heal indices"
                        );
                        HashMap::new()
                    }
                };

                for kv_idx in indices {
                    let resolved = metas.get(&kv_idx).is_some_and(|auth| {
                        by_idx
                            .get(&kv_idx)
                            .is_some_and(|payload| {
                                self.verify_and_store(shard, kv_idx, payload, auth)
                            })
                    });
                    if resolved {
                        verified += 1;
                    }
                    task.heal.settle(kv_idx, resolved);
                }
            }
        }

        verified
    }

    /// Decode a payload with the serving host's parameters, verify it
    /// against the authoritative meta, and persist it re-encoded for the
    /// local miner. A mismatch never touches local storage.
    fn verify_and_store(
        &self,
        shard: &ShardHandle,
        kv_idx: u64,
        payload: &KvPayload,
        auth: &KvMeta,
    ) -> bool {
        if payload.encoded.len() as u64 != shard.config().kv_size {
            warn!(kv_idx, len = payload.encoded.len(), "payload has wrong encoded size");
            return false;
        }

        let decoded = decode_kv(&payload.encoded, kv_idx, payload.miner, payload.encode_type);
        let actual = meta_of(&decoded);
        if actual.commitment() != auth.commitment() {
            warn!(kv_idx, "commitment verification failed, routing to heal");
            return false;
        }

        match shard.encode_and_write(kv_idx, &decoded, *auth) {
            Ok(()) => true,
            Err(e) => {
                error!(kv_idx, error = %e, "failed to persist verified entry");
                false
            }
        }
    }

    /// Emit [`AllShardsDone`] once every hosted shard's task is done.
    fn finish_if_all_done(&self) {
        let hosted = self.registry.hosted();
        let all_done = {
            let tasks = self.tasks.lock().expect("task map lock poisoned");
            hosted
                .iter()
                .all(|key| tasks.get(key).is_some_and(|t| t.state == SyncState::Done))
        };
        if all_done && !self.all_done_emitted.swap(true, Ordering::SeqCst) {
            info!("all hosted shards synced");
            self.events.emit(AllShardsDone);
        }
    }
}

impl std::fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncScheduler")
            .field("config", &self.config)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
