// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Worker storage: the per-stage partition table and the dump policy.
//!
//! Appends run on the server's connection tasks and touch only per-partition
//! state (the table is sharded, independent partitions never contend). All
//! flush scheduling funnels through one event loop, which serializes policy
//! decisions without a global lock. The dump policy fires on the earliest
//! of: partition buffer over `block.size * dump.block.factor`, resident
//! memory over the governor's low-water mark, partition idle timeout, and
//! stage finalize.
//!
//! A block arriving with a later stage attempt supersedes the stored state:
//! the old attempt is discarded and a fresh partition table is opened.
//! Blocks of earlier attempts are rejected as aborted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use log::{debug, info, warn};
use object_store::ObjectStore;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use rss_core::block::BlockFrame;
use rss_core::cluster::ClusterConf;
use rss_core::config::RssConfig;
use rss_core::error::{Result, RssError};
use rss_core::event_loop::{EventAction, EventLoop, EventSender};
use rss_core::ids::StageShuffleId;
use rss_core::layout;
use rss_core::protocol::SendBlockRequest;
use rss_core::util::timestamp_millis;

use crate::buffer::{AppendOutcome, PartitionBuffer, PartitionPhase};
use crate::dumper::{DumperPool, FlushJob, FlushOutcome};
use crate::memory::MemoryGovernor;

/// Stage identity without the attempt number: the map key under which
/// successive stage attempts replace one another.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StageKey {
    pub app_id: String,
    pub app_attempt: String,
    pub shuffle_id: u32,
}

impl From<&StageShuffleId> for StageKey {
    fn from(stage: &StageShuffleId) -> Self {
        Self {
            app_id: stage.app_id.clone(),
            app_attempt: stage.app_attempt.clone(),
            shuffle_id: stage.shuffle_id,
        }
    }
}

/// Tunables lifted out of [`RssConfig`] at startup.
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Partition buffer size that triggers a flush.
    pub flush_threshold: usize,
    pub partition_idle_timeout: Duration,
    /// Age after which in-memory stage state of an idle app is evicted.
    pub app_obj_retention: Duration,
    pub dumper_threads: usize,
    pub dumper_queue_size: usize,
    pub flush_retries: usize,
}

impl StorageOptions {
    pub fn from_config(config: &RssConfig) -> Self {
        Self {
            flush_threshold: config.block_size() * config.dump_block_factor().max(1),
            partition_idle_timeout: Duration::from_millis(
                config.partition_idle_timeout_millis(),
            ),
            app_obj_retention: Duration::from_millis(config.app_obj_retention_millis()),
            dumper_threads: config.dumper_threads(),
            dumper_queue_size: config.dumper_queue_size(),
            flush_retries: config.network_retries(),
        }
    }
}

/// Events serialized through the storage loop.
pub enum StoreEvent {
    FlushPartition {
        key: StageKey,
        partition_id: u32,
    },
    MemoryPressure,
    IdleSweep,
    Finalize {
        stage: StageShuffleId,
        ack: oneshot::Sender<std::result::Result<(), String>>,
    },
    FlushDone {
        outcome: FlushOutcome,
    },
}

struct StageState {
    stage: StageShuffleId,
    num_partitions: u32,
    partitions: DashMap<u32, Mutex<PartitionBuffer>>,
    /// Epoch millis of the last append or finalize touching this stage.
    last_active: AtomicU64,
    aborted: AtomicBool,
    /// Flush chunks submitted to dumpers and not yet completed.
    in_flight: AtomicUsize,
    finalizing: AtomicBool,
    waiters: Mutex<Vec<oneshot::Sender<std::result::Result<(), String>>>>,
}

impl StageState {
    fn new(stage: StageShuffleId, num_partitions: u32) -> Self {
        Self {
            stage,
            num_partitions,
            partitions: DashMap::new(),
            last_active: AtomicU64::new(timestamp_millis()),
            aborted: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            finalizing: AtomicBool::new(false),
            waiters: Mutex::new(Vec::new()),
        }
    }

    fn touch(&self) {
        self.last_active.store(timestamp_millis(), Ordering::Release);
    }

    fn settle_finalize(&self) {
        if !self.finalizing.load(Ordering::Acquire)
            || self.in_flight.load(Ordering::Acquire) > 0
        {
            return;
        }
        let aborted = self.aborted.load(Ordering::Acquire);
        for waiter in self.waiters.lock().drain(..) {
            let _ = waiter.send(if aborted {
                Err(format!("stage {} aborted during flush", self.stage))
            } else {
                Ok(())
            });
        }
    }
}

pub struct ShuffleStorage {
    worker_id: String,
    cluster_conf: ClusterConf,
    opts: StorageOptions,
    stages: DashMap<StageKey, Arc<StageState>>,
    governor: Arc<MemoryGovernor>,
    dumpers: DumperPool,
    events: Mutex<Option<EventSender<StoreEvent>>>,
    stopped: AtomicBool,
}

impl ShuffleStorage {
    /// Builds the storage, its dumper pool and its event loop, and starts
    /// the background tasks.
    pub fn start(
        worker_id: String,
        cluster_conf: ClusterConf,
        config: &RssConfig,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Arc<Self>> {
        let opts = StorageOptions::from_config(config);
        let governor = Arc::new(MemoryGovernor::new(
            config.memory_control_size_threshold(),
            config.memory_control_low_water_ratio(),
        ));

        let (completion_tx, mut completion_rx) = mpsc::channel::<FlushOutcome>(
            opts.dumper_threads * opts.dumper_queue_size,
        );
        let dumpers = DumperPool::new(
            store,
            governor.clone(),
            opts.dumper_threads,
            opts.dumper_queue_size,
            opts.flush_retries,
            completion_tx,
        );

        let storage = Arc::new(Self {
            worker_id,
            cluster_conf,
            opts,
            stages: DashMap::new(),
            governor,
            dumpers,
            events: Mutex::new(None),
            stopped: AtomicBool::new(false),
        });

        let mut event_loop = EventLoop::new(
            "shuffle-storage",
            1024,
            Arc::new(StorageAction {
                storage: storage.clone(),
            }),
        );
        let sender = event_loop.start()?;
        *storage.events.lock() = Some(sender.clone());

        // Flush completions re-enter the loop so state updates stay
        // serialized with policy decisions.
        {
            let sender = sender.clone();
            tokio::spawn(async move {
                while let Some(outcome) = completion_rx.recv().await {
                    if sender.post(StoreEvent::FlushDone { outcome }).await.is_err() {
                        break;
                    }
                }
            });
        }

        // Idle sweep drives the idle-timeout dump trigger and app eviction.
        {
            let sender = sender.clone();
            let storage = storage.clone();
            let tick = storage.opts.partition_idle_timeout.min(Duration::from_secs(5));
            let tick = tick.max(Duration::from_millis(50)) / 2;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(tick);
                interval.set_missed_tick_behavior(
                    tokio::time::MissedTickBehavior::Delay,
                );
                loop {
                    interval.tick().await;
                    if storage.stopped.load(Ordering::Acquire) {
                        break;
                    }
                    sender.try_post(StoreEvent::IdleSweep);
                }
            });
        }

        Ok(storage)
    }

    pub fn governor(&self) -> &MemoryGovernor {
        &self.governor
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        *self.events.lock() = None;
    }

    fn sender(&self) -> Result<EventSender<StoreEvent>> {
        self.events
            .lock()
            .clone()
            .ok_or_else(|| RssError::Internal("shuffle storage stopped".to_owned()))
    }

    /// Resolves (or opens) the stage state a block belongs to, applying the
    /// stage-attempt supersede rule.
    fn resolve_stage(&self, stage: &StageShuffleId, num_partitions: u32) -> Result<Arc<StageState>> {
        let key = StageKey::from(stage);
        loop {
            let state = self
                .stages
                .entry(key.clone())
                .or_insert_with(|| {
                    Arc::new(StageState::new(stage.clone(), num_partitions))
                })
                .value()
                .clone();

            use std::cmp::Ordering::*;
            match stage.stage_attempt.cmp(&state.stage.stage_attempt) {
                Equal => return Ok(state),
                Less => {
                    return Err(RssError::StageAborted(format!(
                        "{stage} superseded by stage attempt {}",
                        state.stage.stage_attempt
                    )));
                }
                Greater => {
                    info!(
                        "Stage attempt {} supersedes {} for {}/{} shuffle {}",
                        stage.stage_attempt,
                        state.stage.stage_attempt,
                        key.app_id,
                        key.app_attempt,
                        key.shuffle_id
                    );
                    self.discard_stage(&state);
                    self.stages.insert(
                        key.clone(),
                        Arc::new(StageState::new(stage.clone(), num_partitions)),
                    );
                }
            }
        }
    }

    /// Drops a stage's buffered bytes and rejects its future arrivals.
    /// Pending finalize waiters resolve immediately; in-flight chunks of the
    /// discarded attempt release their memory in the dumpers and their late
    /// completions are ignored.
    fn discard_stage(&self, state: &StageState) {
        state.aborted.store(true, Ordering::Release);
        for entry in state.partitions.iter() {
            let mut buffer = entry.value().lock();
            let resident = buffer.buffered_bytes();
            if resident > 0 {
                self.governor.release(resident as u64);
            }
            buffer.abort();
        }
        for waiter in state.waiters.lock().drain(..) {
            let _ = waiter.send(Err(format!("{} discarded", state.stage)));
        }
    }

    /// Accepts one block. Returns `true` when the block was a duplicate.
    pub async fn append_block(&self, request: &SendBlockRequest) -> Result<bool> {
        if request.num_partitions == 0 {
            return Err(RssError::Protocol(
                "block carries zero num_partitions".to_owned(),
            ));
        }
        let state = self.resolve_stage(&request.stage, request.num_partitions)?;
        if state.aborted.load(Ordering::Acquire) {
            return Err(RssError::StageAborted(format!(
                "{} is aborted on this worker",
                request.stage
            )));
        }
        if request.partition_id >= state.num_partitions {
            return Err(RssError::Protocol(format!(
                "partition {} out of range [0, {})",
                request.partition_id, state.num_partitions
            )));
        }

        let frame = BlockFrame::new(
            request.map_id,
            request.map_attempt,
            request.seq_no,
            request.payload.clone(),
        );
        let encoded = frame.encoded_len() as u64;

        if !self.governor.try_reserve(encoded) {
            // Kick the drain and refuse; the client retries with backoff.
            if let Ok(sender) = self.sender() {
                sender.try_post(StoreEvent::MemoryPressure);
            }
            return Err(RssError::Backpressure(format!(
                "worker {} resident bytes over {} threshold",
                self.worker_id,
                self.governor.threshold()
            )));
        }

        let outcome = {
            let buffer = state
                .partitions
                .entry(request.partition_id)
                .or_insert_with(|| {
                    Mutex::new(PartitionBuffer::new(request.partition_id))
                });
            let mut buffer = buffer.lock();
            buffer.append(&frame)
        };
        state.touch();

        match outcome {
            AppendOutcome::Appended { buffered } => {
                let sender = self.sender()?;
                if buffered >= self.opts.flush_threshold {
                    sender
                        .post(StoreEvent::FlushPartition {
                            key: StageKey::from(&request.stage),
                            partition_id: request.partition_id,
                        })
                        .await?;
                } else if self.governor.over_low_water() {
                    sender.try_post(StoreEvent::MemoryPressure);
                }
                Ok(false)
            }
            AppendOutcome::Duplicate => {
                self.governor.release(encoded);
                debug!(
                    "DuplicateBlock {} partition {} map-{}.{} seq-{}",
                    request.stage,
                    request.partition_id,
                    request.map_id,
                    request.map_attempt,
                    request.seq_no
                );
                Ok(true)
            }
            AppendOutcome::Rejected(phase) => {
                self.governor.release(encoded);
                Err(RssError::StageAborted(format!(
                    "partition {} of {} is {:?}",
                    request.partition_id, request.stage, phase
                )))
            }
        }
    }

    /// Flushes and closes every partition of the stage, resolving once all
    /// chunks are durable on the DFS.
    pub async fn finalize_stage(&self, stage: &StageShuffleId) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.sender()?
            .post(StoreEvent::Finalize {
                stage: stage.clone(),
                ack,
            })
            .await?;
        match done.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(RssError::StageAborted(message)),
            Err(_) => Err(RssError::Internal(
                "storage loop dropped a finalize ack".to_owned(),
            )),
        }
    }

    /// Evicts in-memory state for apps idle longer than the retention.
    pub fn evict_stale_stages(&self) {
        let retention = self.opts.app_obj_retention.as_millis() as u64;
        let now = timestamp_millis();
        let stale: Vec<(StageKey, Arc<StageState>)> = self
            .stages
            .iter()
            .filter(|e| {
                let idle = now.saturating_sub(e.value().last_active.load(Ordering::Acquire));
                idle > retention
                    && e.value().in_flight.load(Ordering::Acquire) == 0
                    && !e.value().finalizing.load(Ordering::Acquire)
            })
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (key, state) in stale {
            info!(
                "Evicting idle stage state {}/{} shuffle {}",
                key.app_id, key.app_attempt, key.shuffle_id
            );
            self.discard_stage(&state);
            self.stages.remove(&key);
        }
    }

    async fn submit_chunk(
        &self,
        state: &Arc<StageState>,
        partition_id: u32,
        chunk: Bytes,
        flush_seq: u32,
    ) {
        let path = layout::part_file(
            &self.cluster_conf,
            &state.stage,
            partition_id,
            &self.worker_id,
            flush_seq,
        );
        state.in_flight.fetch_add(1, Ordering::AcqRel);
        let job = FlushJob {
            key: StageKey::from(&state.stage),
            stage_attempt: state.stage.stage_attempt,
            partition_id,
            path,
            data: chunk,
        };
        if let Err(e) = self.dumpers.submit(job).await {
            warn!("Dumper submit failed: {e}");
            state.aborted.store(true, Ordering::Release);
            state.in_flight.fetch_sub(1, Ordering::AcqRel);
            state.settle_finalize();
        }
    }

    async fn handle_flush_partition(&self, key: &StageKey, partition_id: u32) {
        let Some(state) = self.stages.get(key).map(|e| e.value().clone()) else {
            return;
        };
        let taken = {
            let Some(buffer) = state.partitions.get(&partition_id) else {
                return;
            };
            let mut buffer = buffer.lock();
            if buffer.phase() == PartitionPhase::Aborted {
                None
            } else {
                buffer.take_chunk()
            }
        };
        if let Some((chunk, seq)) = taken {
            self.submit_chunk(&state, partition_id, chunk, seq).await;
        }
    }

    /// Drains every non-empty partition buffer, largest first.
    async fn handle_memory_pressure(&self) {
        let mut candidates: Vec<(usize, StageKey, u32)> = Vec::new();
        for stage in self.stages.iter() {
            for partition in stage.value().partitions.iter() {
                let buffer = partition.value().lock();
                if buffer.buffered_bytes() > 0
                    && buffer.phase() != PartitionPhase::Aborted
                {
                    candidates.push((
                        buffer.buffered_bytes(),
                        stage.key().clone(),
                        buffer.partition_id(),
                    ));
                }
            }
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, key, partition_id) in candidates {
            self.handle_flush_partition(&key, partition_id).await;
        }
    }

    async fn handle_idle_sweep(&self) {
        let idle_limit = self.opts.partition_idle_timeout;
        let mut idle: Vec<(StageKey, u32)> = Vec::new();
        for stage in self.stages.iter() {
            for partition in stage.value().partitions.iter() {
                let buffer = partition.value().lock();
                if buffer.buffered_bytes() > 0
                    && buffer.idle_since().elapsed() >= idle_limit
                    && buffer.phase() != PartitionPhase::Aborted
                {
                    idle.push((stage.key().clone(), buffer.partition_id()));
                }
            }
        }
        for (key, partition_id) in idle {
            debug!(
                "Flushing idle partition {partition_id} of {}/{} shuffle {}",
                key.app_id, key.app_attempt, key.shuffle_id
            );
            self.handle_flush_partition(&key, partition_id).await;
        }
        self.evict_stale_stages();
    }

    async fn handle_finalize(
        &self,
        stage: &StageShuffleId,
        ack: oneshot::Sender<std::result::Result<(), String>>,
    ) {
        let key = StageKey::from(stage);
        let Some(state) = self.stages.get(&key).map(|e| e.value().clone()) else {
            // Nothing buffered here for this stage; trivially complete.
            let _ = ack.send(Ok(()));
            return;
        };

        use std::cmp::Ordering::*;
        match state.stage.stage_attempt.cmp(&stage.stage_attempt) {
            Greater => {
                let _ = ack.send(Err(format!(
                    "{stage} superseded by stage attempt {}",
                    state.stage.stage_attempt
                )));
                return;
            }
            Less => {
                // Only an older attempt reached this worker; its state is
                // stale and the finalizing attempt stored nothing here.
                self.discard_stage(&state);
                self.stages.remove(&key);
                let _ = ack.send(Ok(()));
                return;
            }
            Equal => {}
        }

        if state.aborted.load(Ordering::Acquire) {
            let _ = ack.send(Err(format!("{stage} is aborted on this worker")));
            return;
        }

        state.finalizing.store(true, Ordering::Release);
        state.touch();

        let partition_ids: Vec<u32> =
            state.partitions.iter().map(|e| *e.key()).collect();
        for partition_id in partition_ids {
            let taken = {
                let Some(buffer) = state.partitions.get(&partition_id) else {
                    continue;
                };
                let mut buffer = buffer.lock();
                if buffer.phase() == PartitionPhase::Aborted {
                    continue;
                }
                let taken = buffer.take_chunk();
                buffer.close();
                taken
            };
            if let Some((chunk, seq)) = taken {
                self.submit_chunk(&state, partition_id, chunk, seq).await;
            }
        }

        if state.in_flight.load(Ordering::Acquire) == 0 {
            let aborted = state.aborted.load(Ordering::Acquire);
            let _ = ack.send(if aborted {
                Err(format!("{stage} aborted during flush"))
            } else {
                Ok(())
            });
        } else {
            state.waiters.lock().push(ack);
        }
    }

    fn handle_flush_done(&self, outcome: FlushOutcome) {
        let Some(state) = self.stages.get(&outcome.key).map(|e| e.value().clone())
        else {
            return;
        };
        if state.stage.stage_attempt != outcome.stage_attempt {
            // A superseded attempt's flush completed; its memory was already
            // released by the dumper and its state discarded.
            return;
        }
        if let Some(buffer) = state.partitions.get(&outcome.partition_id) {
            let mut buffer = buffer.lock();
            match outcome.result {
                Ok(record) => buffer.complete_flush(Some(record)),
                Err(ref message) => {
                    warn!(
                        "Partition {} of {} aborted: {message}",
                        outcome.partition_id, state.stage
                    );
                    buffer.complete_flush(None);
                    state.aborted.store(true, Ordering::Release);
                }
            }
        }
        state.in_flight.fetch_sub(1, Ordering::AcqRel);
        state.settle_finalize();
    }
}

struct StorageAction {
    storage: Arc<ShuffleStorage>,
}

#[async_trait::async_trait]
impl EventAction<StoreEvent> for StorageAction {
    async fn on_receive(
        &self,
        event: StoreEvent,
        _poster: &EventSender<StoreEvent>,
    ) -> Result<()> {
        match event {
            StoreEvent::FlushPartition { key, partition_id } => {
                self.storage.handle_flush_partition(&key, partition_id).await;
            }
            StoreEvent::MemoryPressure => {
                self.storage.handle_memory_pressure().await;
            }
            StoreEvent::IdleSweep => {
                self.storage.handle_idle_sweep().await;
            }
            StoreEvent::Finalize { stage, ack } => {
                self.storage.handle_finalize(&stage, ack).await;
            }
            StoreEvent::FlushDone { outcome } => {
                self.storage.handle_flush_done(outcome);
            }
        }
        Ok(())
    }

    fn on_error(&self, error: RssError) {
        warn!("Storage event failed: {error}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use object_store::memory::InMemory;
    use rss_core::config::{
        RSS_BLOCK_SIZE, RSS_DUMP_BLOCK_FACTOR, RSS_MEMORY_CONTROL_SIZE_THRESHOLD,
    };

    fn test_config(block_size: usize, memory: u64) -> RssConfig {
        RssConfig::builder()
            .set(RSS_BLOCK_SIZE, &block_size.to_string())
            .set(RSS_DUMP_BLOCK_FACTOR, "2")
            .set(RSS_MEMORY_CONTROL_SIZE_THRESHOLD, &memory.to_string())
            .build()
            .unwrap()
    }

    fn request(
        stage: &StageShuffleId,
        partition: u32,
        map_id: u32,
        attempt: u16,
        seq: u32,
        payload: &[u8],
    ) -> SendBlockRequest {
        SendBlockRequest {
            stage: stage.clone(),
            partition_id: partition,
            num_partitions: 4,
            map_id,
            map_attempt: attempt,
            seq_no: seq,
            terminator: payload.is_empty(),
            payload: Bytes::copy_from_slice(payload),
        }
    }

    async fn part_files(store: &Arc<InMemory>) -> Vec<String> {
        let metas: Vec<_> = store
            .as_ref()
            .list(None)
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
        metas
            .into_iter()
            .map(|m| m.location.to_string())
            .filter(|p| p.contains("part-"))
            .collect()
    }

    #[tokio::test]
    async fn finalize_flushes_buffered_blocks() {
        let store = Arc::new(InMemory::new());
        let dfs: Arc<dyn ObjectStore> = store.clone();
        let storage = ShuffleStorage::start(
            "w1".to_owned(),
            ClusterConf::default(),
            &test_config(1 << 20, 1 << 30),
            dfs,
        )
        .unwrap();

        let stage = StageShuffleId::new("app-1", "1", 0, 0);
        for seq in 0..3 {
            let dup = storage
                .append_block(&request(&stage, 1, 5, 0, seq, b"hello world"))
                .await
                .unwrap();
            assert!(!dup);
        }
        assert!(part_files(&store).await.is_empty());

        storage.finalize_stage(&stage).await.unwrap();
        let files = part_files(&store).await;
        assert_eq!(files.len(), 1);
        assert!(files[0].contains("partition-1/part-w1-00000"));
        assert_eq!(storage.governor().used(), 0);
    }

    #[tokio::test]
    async fn buffer_threshold_triggers_a_dump() {
        let store = Arc::new(InMemory::new());
        let dfs: Arc<dyn ObjectStore> = store.clone();
        // Flush threshold = 64 * 2 bytes.
        let storage = ShuffleStorage::start(
            "w1".to_owned(),
            ClusterConf::default(),
            &test_config(64, 1 << 30),
            dfs,
        )
        .unwrap();

        let stage = StageShuffleId::new("app-1", "1", 0, 0);
        for seq in 0..4 {
            storage
                .append_block(&request(&stage, 0, 1, 0, seq, &[7u8; 64]))
                .await
                .unwrap();
        }
        // The dump policy fired without finalize.
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if !part_files(&store).await.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("dump policy should flush a full buffer");
    }

    #[tokio::test]
    async fn duplicates_ack_without_rebuffering() {
        let store = Arc::new(InMemory::new());
        let dfs: Arc<dyn ObjectStore> = store.clone();
        let storage = ShuffleStorage::start(
            "w1".to_owned(),
            ClusterConf::default(),
            &test_config(1 << 20, 1 << 30),
            dfs,
        )
        .unwrap();

        let stage = StageShuffleId::new("app-1", "1", 0, 0);
        let block = request(&stage, 2, 7, 0, 3, b"payload");
        assert!(!storage.append_block(&block).await.unwrap());
        let used_after_first = storage.governor().used();
        assert!(storage.append_block(&block).await.unwrap());
        assert_eq!(storage.governor().used(), used_after_first);
    }

    #[tokio::test]
    async fn over_threshold_appends_are_refused_then_readmitted() {
        let store = Arc::new(InMemory::new());
        let dfs: Arc<dyn ObjectStore> = store.clone();
        // Threshold 100, low water 75: the first 50-byte block neither
        // flushes nor drains, so the second append deterministically trips
        // the governor.
        let storage = ShuffleStorage::start(
            "w1".to_owned(),
            ClusterConf::default(),
            &test_config(1 << 20, 100),
            dfs,
        )
        .unwrap();

        let stage = StageShuffleId::new("app-1", "1", 0, 0);
        storage
            .append_block(&request(&stage, 0, 0, 0, 0, &[1u8; 32]))
            .await
            .unwrap();
        let refused = request(&stage, 0, 0, 0, 1, &[1u8; 40]);
        let err = storage.append_block(&refused).await.unwrap_err();
        assert!(matches!(err, RssError::Backpressure(_)));
        assert!(err.is_retryable());

        // The refusal kicked the drain; a retry goes through once resident
        // bytes return below the threshold.
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match storage.append_block(&refused).await {
                    Ok(_) => break,
                    Err(RssError::Backpressure(_)) => {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                    Err(other) => panic!("unexpected error: {other}"),
                }
            }
        })
        .await
        .expect("drained worker should accept the retried block");
    }

    #[tokio::test]
    async fn later_stage_attempt_supersedes_earlier_state() {
        let store = Arc::new(InMemory::new());
        let dfs: Arc<dyn ObjectStore> = store.clone();
        let storage = ShuffleStorage::start(
            "w1".to_owned(),
            ClusterConf::default(),
            &test_config(1 << 20, 1 << 30),
            dfs,
        )
        .unwrap();

        let attempt0 = StageShuffleId::new("app-1", "1", 0, 0);
        let attempt1 = StageShuffleId::new("app-1", "1", 1, 0);

        storage
            .append_block(&request(&attempt0, 0, 0, 0, 0, b"old attempt"))
            .await
            .unwrap();
        storage
            .append_block(&request(&attempt1, 0, 0, 0, 0, b"new attempt"))
            .await
            .unwrap();

        // The superseded attempt is rejected from here on.
        let err = storage
            .append_block(&request(&attempt0, 0, 0, 0, 1, b"stale"))
            .await
            .unwrap_err();
        assert!(matches!(err, RssError::StageAborted(_)));

        storage.finalize_stage(&attempt1).await.unwrap();
        let files = part_files(&store).await;
        assert_eq!(files.len(), 1);
        assert!(files[0].contains("stage-1/"));
    }

    #[tokio::test]
    async fn finalize_then_append_is_rejected_until_new_attempt() {
        let store = Arc::new(InMemory::new());
        let dfs: Arc<dyn ObjectStore> = store.clone();
        let storage = ShuffleStorage::start(
            "w1".to_owned(),
            ClusterConf::default(),
            &test_config(1 << 20, 1 << 30),
            dfs,
        )
        .unwrap();

        let stage = StageShuffleId::new("app-1", "1", 0, 0);
        storage
            .append_block(&request(&stage, 0, 0, 0, 0, b"data"))
            .await
            .unwrap();
        storage.finalize_stage(&stage).await.unwrap();

        let err = storage
            .append_block(&request(&stage, 0, 0, 0, 1, b"late"))
            .await
            .unwrap_err();
        assert!(matches!(err, RssError::StageAborted(_)));

        // A fresh stage attempt opens new state.
        let retry = StageShuffleId::new("app-1", "1", 1, 0);
        assert!(!storage
            .append_block(&request(&retry, 0, 0, 0, 0, b"retry data"))
            .await
            .unwrap());
    }
}
