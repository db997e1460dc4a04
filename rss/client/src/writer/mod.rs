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

//! Map-side writers.
//!
//! Strategy selection is a pure function of the dependency shape and
//! configuration: *bypass* for narrow, combine-free shuffles; *arena* (the
//! `unsafe` setting) when serialized values relocate and there is no
//! aggregation; *sort* otherwise. All strategies feed the same
//! [`BlockPipeline`], which packetizes partition bytes into blocks of
//! `block.size`, stamps monotonic seq_nos per (map attempt, partition),
//! bounds the in-flight window, and sends terminator blocks at close.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;

use rss_core::cluster::WorkerDetail;
use rss_core::config::RssConfig;
use rss_core::error::{Result, RssError};
use rss_core::handle::ShuffleHandle;
use rss_core::protocol::SendBlockRequest;
use rss_core::util::backoff_delay;

use crate::connection::{ConnectOptions, WorkerConnection};

mod arena;
mod bypass;
mod sort;

pub use arena::ArenaWriter;
pub use bypass::BypassWriter;
pub use sort::SortWriter;

/// The shape of the shuffle dependency, as reported by the host engine.
#[derive(Debug, Clone)]
pub struct ShuffleDependency {
    pub num_partitions: u32,
    pub map_side_combine: bool,
    pub serializer_relocatable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterKind {
    Bypass,
    Arena,
    Sort,
}

/// Picks the write strategy for a map task.
pub fn select_writer_kind(
    dependency: &ShuffleDependency,
    config: &RssConfig,
) -> Result<WriterKind> {
    match config.writer_type().as_str() {
        "bypass" => Ok(WriterKind::Bypass),
        "unsafe" => Ok(WriterKind::Arena),
        "sort" => Ok(WriterKind::Sort),
        "auto" => {
            if dependency.num_partitions as usize <= config.bypass_threshold()
                && !dependency.map_side_combine
            {
                Ok(WriterKind::Bypass)
            } else if dependency.serializer_relocatable && !dependency.map_side_combine
            {
                Ok(WriterKind::Arena)
            } else {
                Ok(WriterKind::Sort)
            }
        }
        other => Err(RssError::Configuration(format!(
            "unknown writer type '{other}'"
        ))),
    }
}

/// Totals reported by a writer at close.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteStats {
    pub records: u64,
    pub blocks: u64,
    pub bytes: u64,
}

/// A map-side writer with a common write/close contract across strategies.
pub enum ShuffleWriter {
    Bypass(BypassWriter),
    Arena(ArenaWriter),
    Sort(SortWriter),
}

impl ShuffleWriter {
    pub fn open(
        handle: Arc<ShuffleHandle>,
        map_id: u32,
        map_attempt: u16,
        dependency: &ShuffleDependency,
        config: &RssConfig,
    ) -> Result<Self> {
        let kind = select_writer_kind(dependency, config)?;
        debug!(
            "Opening {kind:?} writer for map-{map_id}.{map_attempt} of {}",
            handle.stage
        );
        let pipeline = BlockPipeline::new(handle, map_id, map_attempt, config);
        Ok(match kind {
            WriterKind::Bypass => {
                ShuffleWriter::Bypass(BypassWriter::new(pipeline, config))
            }
            WriterKind::Arena => ShuffleWriter::Arena(ArenaWriter::new(pipeline, config)),
            WriterKind::Sort => ShuffleWriter::Sort(SortWriter::new(pipeline, config)?),
        })
    }

    pub fn kind(&self) -> WriterKind {
        match self {
            ShuffleWriter::Bypass(_) => WriterKind::Bypass,
            ShuffleWriter::Arena(_) => WriterKind::Arena,
            ShuffleWriter::Sort(_) => WriterKind::Sort,
        }
    }

    /// Writes one record into a partition.
    pub async fn write(&mut self, partition_id: u32, record: &[u8]) -> Result<()> {
        match self {
            ShuffleWriter::Bypass(w) => w.write(partition_id, record).await,
            ShuffleWriter::Arena(w) => w.write(partition_id, record).await,
            ShuffleWriter::Sort(w) => w.write(partition_id, record).await,
        }
    }

    /// Flushes everything, sends terminators and waits for the last ack. A
    /// block is durable once acked; any unacked block fails the task here.
    pub async fn close(self) -> Result<WriteStats> {
        match self {
            ShuffleWriter::Bypass(w) => w.close().await,
            ShuffleWriter::Arena(w) => w.close().await,
            ShuffleWriter::Sort(w) => w.close().await,
        }
    }
}

struct Lane {
    tx: mpsc::Sender<LaneItem>,
    task: JoinHandle<()>,
}

struct LaneItem {
    request: SendBlockRequest,
    _window: tokio::sync::OwnedSemaphorePermit,
}

/// The common block pipeline: per-partition seq_no assignment, routing to
/// the partition's group member, a bounded in-flight window, and one sender
/// task per target worker with bounded retries.
pub struct BlockPipeline {
    handle: Arc<ShuffleHandle>,
    map_id: u32,
    map_attempt: u16,
    opts: ConnectOptions,
    window: Arc<Semaphore>,
    lane_depth: usize,
    next_seq: HashMap<u32, u32>,
    lanes: HashMap<String, Lane>,
    failure: Arc<Mutex<Option<String>>>,
    stats: WriteStats,
}

impl BlockPipeline {
    pub fn new(
        handle: Arc<ShuffleHandle>,
        map_id: u32,
        map_attempt: u16,
        config: &RssConfig,
    ) -> Self {
        let window = config.max_flying_package_num().max(1);
        Self {
            handle,
            map_id,
            map_attempt,
            opts: ConnectOptions::from_config(config),
            window: Arc::new(Semaphore::new(window)),
            lane_depth: window,
            next_seq: HashMap::new(),
            lanes: HashMap::new(),
            failure: Arc::new(Mutex::new(None)),
            stats: WriteStats::default(),
        }
    }

    fn check_failure(&self) -> Result<()> {
        if let Some(message) = self.failure.lock().clone() {
            return Err(RssError::General(format!(
                "shuffle write failed after retries: {message}"
            )));
        }
        Ok(())
    }

    /// Submits one sealed block payload for a partition.
    pub async fn submit(&mut self, partition_id: u32, payload: Bytes) -> Result<()> {
        self.check_failure()?;
        let seq = self.next_seq.entry(partition_id).or_insert(0);
        let seq_no = *seq;
        *seq += 1;

        self.stats.blocks += 1;
        self.stats.bytes += payload.len() as u64;

        let request = SendBlockRequest {
            stage: self.handle.stage.clone(),
            partition_id,
            num_partitions: self.handle.num_partitions,
            map_id: self.map_id,
            map_attempt: self.map_attempt,
            seq_no,
            terminator: false,
            payload,
        };
        self.dispatch(partition_id, request).await
    }

    async fn dispatch(
        &mut self,
        partition_id: u32,
        request: SendBlockRequest,
    ) -> Result<()> {
        let permit = self
            .window
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RssError::Internal("in-flight window closed".to_owned()))?;

        let worker = self.handle.worker_for_partition(partition_id).clone();
        let lane = self.lane_for(worker);
        lane.tx
            .send(LaneItem {
                request,
                _window: permit,
            })
            .await
            .map_err(|_| {
                RssError::Internal("block sender task stopped".to_owned())
            })?;
        self.check_failure()
    }

    fn lane_for(&mut self, worker: WorkerDetail) -> &Lane {
        let name = worker.name();
        let depth = self.lane_depth;
        let app_id = self.handle.stage.app_id.clone();
        let app_attempt = self.handle.stage.app_attempt.clone();
        let opts = self.opts.clone();
        let failure = self.failure.clone();
        self.lanes.entry(name).or_insert_with(move || {
            let (tx, rx) = mpsc::channel(depth);
            let task =
                tokio::spawn(run_lane(worker, app_id, app_attempt, rx, opts, failure));
            Lane { tx, task }
        })
    }

    /// Sends the end-of-output terminator for every touched partition, then
    /// drains the lanes and surfaces any send failure.
    pub async fn finish(mut self) -> Result<WriteStats> {
        self.check_failure()?;

        let touched: Vec<(u32, u32)> = self
            .next_seq
            .iter()
            .map(|(partition, next)| (*partition, *next))
            .collect();
        for (partition_id, seq_no) in touched {
            let request = SendBlockRequest {
                stage: self.handle.stage.clone(),
                partition_id,
                num_partitions: self.handle.num_partitions,
                map_id: self.map_id,
                map_attempt: self.map_attempt,
                seq_no,
                terminator: true,
                payload: Bytes::new(),
            };
            self.dispatch(partition_id, request).await?;
        }

        for (_, lane) in self.lanes.drain() {
            drop(lane.tx);
            lane.task.await?;
        }
        self.check_failure()?;
        Ok(self.stats)
    }

    pub(crate) fn note_records(&mut self, count: u64) {
        self.stats.records += count;
    }
}

/// One sender task per target worker: connects lazily, sends blocks in
/// order, retries transient failures with exponential backoff bounded by
/// `network.retries`, and reconnects on connection loss.
async fn run_lane(
    worker: WorkerDetail,
    app_id: String,
    app_attempt: String,
    mut rx: mpsc::Receiver<LaneItem>,
    opts: ConnectOptions,
    failure: Arc<Mutex<Option<String>>>,
) {
    let mut connection: Option<WorkerConnection> = None;
    while let Some(item) = rx.recv().await {
        if failure.lock().is_some() {
            // A block already failed permanently; drain remaining items so
            // the producer unblocks and observes the failure.
            continue;
        }
        let mut attempt = 0usize;
        loop {
            if connection.is_none() {
                match WorkerConnection::connect(&worker, &app_id, &app_attempt, &opts)
                    .await
                {
                    Ok(fresh) => connection = Some(fresh),
                    Err(e) => {
                        if !retry_after(&e, &mut attempt, &opts, &worker, &failure)
                            .await
                        {
                            break;
                        }
                        continue;
                    }
                }
            }
            let Some(active) = connection.as_mut() else {
                continue;
            };
            match active.send_block(&item.request).await {
                Ok(duplicate) => {
                    if duplicate {
                        debug!(
                            "Worker {} acked duplicate block map-{}.{} seq-{}",
                            worker.name(),
                            item.request.map_id,
                            item.request.map_attempt,
                            item.request.seq_no
                        );
                    }
                    break;
                }
                Err(e) => {
                    if matches!(e, RssError::Connection(_) | RssError::IoError(_)) {
                        connection = None;
                    }
                    if !retry_after(&e, &mut attempt, &opts, &worker, &failure).await {
                        break;
                    }
                }
            }
        }
    }
}

/// Decides whether to retry after `error`; records a permanent failure and
/// returns false otherwise.
async fn retry_after(
    error: &RssError,
    attempt: &mut usize,
    opts: &ConnectOptions,
    worker: &WorkerDetail,
    failure: &Arc<Mutex<Option<String>>>,
) -> bool {
    if error.is_retryable() && *attempt < opts.network_retries {
        let delay = backoff_delay(*attempt, 100, 10_000);
        warn!(
            "Send to worker {} failed ({error}); retry {} in {} ms",
            worker.name(),
            *attempt + 1,
            delay.as_millis()
        );
        *attempt += 1;
        tokio::time::sleep(delay).await;
        true
    } else {
        failure.lock().get_or_insert_with(|| error.to_string());
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rss_core::config::{RSS_BYPASS_THRESHOLD, RSS_WRITER_TYPE};

    fn dependency(partitions: u32, combine: bool, relocatable: bool) -> ShuffleDependency {
        ShuffleDependency {
            num_partitions: partitions,
            map_side_combine: combine,
            serializer_relocatable: relocatable,
        }
    }

    #[test]
    fn auto_selection_follows_the_dependency_shape() {
        let config = RssConfig::builder()
            .set(RSS_BYPASS_THRESHOLD, "10")
            .build()
            .unwrap();
        assert_eq!(
            select_writer_kind(&dependency(4, false, false), &config).unwrap(),
            WriterKind::Bypass
        );
        assert_eq!(
            select_writer_kind(&dependency(100, false, true), &config).unwrap(),
            WriterKind::Arena
        );
        assert_eq!(
            select_writer_kind(&dependency(100, false, false), &config).unwrap(),
            WriterKind::Sort
        );
        // Map-side combine rules out both bypass and arena.
        assert_eq!(
            select_writer_kind(&dependency(4, true, true), &config).unwrap(),
            WriterKind::Sort
        );
    }

    #[test]
    fn explicit_writer_type_wins() {
        let config = RssConfig::builder()
            .set(RSS_WRITER_TYPE, "sort")
            .build()
            .unwrap();
        assert_eq!(
            select_writer_kind(&dependency(2, false, true), &config).unwrap(),
            WriterKind::Sort
        );

        let config = RssConfig::builder()
            .set(RSS_WRITER_TYPE, "unsafe")
            .build()
            .unwrap();
        assert_eq!(
            select_writer_kind(&dependency(2, false, false), &config).unwrap(),
            WriterKind::Arena
        );
    }
}
