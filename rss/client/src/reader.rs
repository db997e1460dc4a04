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

//! Reduce-side reader: waits for the stage success marker, then streams all
//! blocks for a partition range from the DFS and reconstructs the record
//! stream.
//!
//! Part files of one partition all come from a single worker and are
//! processed in flush order, so blocks of one map attempt arrive in send
//! order. Fetches run `read.io.threads` deep; assembled output is chunked
//! to `read.merge.size` through a queue bounded by `read.max.size`.
//!
//! De-duplication is by `(map_id, map_attempt, seq_no)`. Only the winning
//! attempt of each map is emitted: the highest attempt whose terminator
//! block arrived with a contiguous seq_no set, or, absent any terminator,
//! the highest attempt with contiguous seq_nos from zero.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::ops::Range;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use futures::TryStreamExt;
use log::{debug, warn};
use object_store::ObjectStore;
use object_store::path::Path;
use tokio::sync::mpsc;

use rss_core::block::{BlockFrame, RecordCursor};
use rss_core::config::RssConfig;
use rss_core::error::{Result, RssError};
use rss_core::handle::ShuffleHandle;
use rss_core::layout;

#[derive(Debug, Clone)]
struct ReaderOptions {
    io_threads: usize,
    merge_size: usize,
    /// Queue depth between assembly and the consumer, in merge-size chunks.
    queue_chunks: usize,
    query_interval: Duration,
    max_wait: Duration,
}

pub struct ShuffleReader {
    handle: Arc<ShuffleHandle>,
    store: Arc<dyn ObjectStore>,
    opts: ReaderOptions,
}

impl ShuffleReader {
    pub fn new(
        handle: Arc<ShuffleHandle>,
        store: Arc<dyn ObjectStore>,
        config: &RssConfig,
    ) -> Self {
        let merge_size = config.read_merge_size().max(1);
        Self {
            handle,
            store,
            opts: ReaderOptions {
                io_threads: config.read_io_threads().max(1),
                merge_size,
                queue_chunks: (config.read_max_size() / merge_size).max(1),
                query_interval: Duration::from_millis(
                    config.input_ready_query_interval_millis().max(1),
                ),
                max_wait: Duration::from_millis(config.input_ready_max_wait_millis()),
            },
        }
    }

    /// Polls for the stage success marker. A `_FAILED` marker aborts early;
    /// exceeding the wait budget is `InputNotReadyError`.
    pub async fn wait_until_ready(&self) -> Result<()> {
        let success = layout::success_marker(&self.handle.cluster_conf, &self.handle.stage);
        let failed = layout::failed_marker(&self.handle.cluster_conf, &self.handle.stage);
        let started = tokio::time::Instant::now();
        loop {
            match self.store.head(&success).await {
                Ok(_) => return Ok(()),
                Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(RssError::Dfs(e)),
            }
            match self.store.head(&failed).await {
                Ok(_) => {
                    return Err(RssError::StageAborted(format!(
                        "{} wrote a failure marker",
                        self.handle.stage
                    )));
                }
                Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(RssError::Dfs(e)),
            }
            if started.elapsed() >= self.opts.max_wait {
                return Err(RssError::InputNotReady(format!(
                    "{} not finalized within {} ms",
                    self.handle.stage,
                    self.opts.max_wait.as_millis()
                )));
            }
            tokio::time::sleep(self.opts.query_interval).await;
        }
    }

    /// Opens the record stream for `[start, end)` partitions restricted to
    /// `[start, end)` map indexes. The returned stream waits for the stage
    /// marker before yielding records.
    pub fn open(&self, partitions: Range<u32>, maps: Range<u32>) -> RecordStream {
        let (tx, rx) = mpsc::channel(self.opts.queue_chunks);
        let reader = Self {
            handle: self.handle.clone(),
            store: self.store.clone(),
            opts: self.opts.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = reader.drive(partitions, maps, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });
        RecordStream {
            rx,
            current: VecDeque::new(),
        }
    }

    async fn drive(
        &self,
        partitions: Range<u32>,
        maps: Range<u32>,
        tx: &mpsc::Sender<Result<Vec<Bytes>>>,
    ) -> Result<()> {
        self.wait_until_ready().await?;
        let mut chunk: Vec<Bytes> = Vec::new();
        let mut chunk_bytes = 0usize;
        for partition_id in partitions {
            self.read_partition(partition_id, &maps, tx, &mut chunk, &mut chunk_bytes)
                .await?;
        }
        if !chunk.is_empty() && tx.send(Ok(chunk)).await.is_err() {
            debug!("Record stream consumer went away");
        }
        Ok(())
    }

    async fn read_partition(
        &self,
        partition_id: u32,
        maps: &Range<u32>,
        tx: &mpsc::Sender<Result<Vec<Bytes>>>,
        chunk: &mut Vec<Bytes>,
        chunk_bytes: &mut usize,
    ) -> Result<()> {
        let dir = layout::partition_dir(
            &self.handle.cluster_conf,
            &self.handle.stage,
            partition_id,
        );
        let metas = self
            .store
            .list(Some(&dir))
            .try_collect::<Vec<_>>()
            .await?;

        // Flush order: part files sorted by (worker, flush seq). One worker
        // serves a partition, so this is also block arrival order.
        let mut files: Vec<(String, u32, Path)> = metas
            .into_iter()
            .filter_map(|meta| {
                let name = meta.location.filename()?.to_owned();
                let (worker, seq) = layout::parse_part_file(&name)?;
                Some((worker, seq, meta.location))
            })
            .collect();
        files.sort_by(|a, b| (a.0.as_str(), a.1).cmp(&(b.0.as_str(), b.1)));

        // `buffered` preserves file order while prefetching ahead.
        let store = self.store.clone();
        let mut fetches = stream::iter(files.into_iter().map(move |(_, _, path)| {
            let store = store.clone();
            async move { store.get(&path).await?.bytes().await }
        }))
        .buffered(self.opts.io_threads);

        let mut accumulators: BTreeMap<u32, MapAccumulator> = BTreeMap::new();
        while let Some(fetched) = fetches.next().await {
            let mut src = fetched.map_err(RssError::Dfs)?;
            while let Some(frame) = BlockFrame::decode(&mut src)? {
                if frame.map_id < maps.start || frame.map_id >= maps.end {
                    continue;
                }
                accumulators
                    .entry(frame.map_id)
                    .or_default()
                    .add(frame);
            }
        }

        for (map_id, accumulator) in accumulators {
            let blocks = accumulator.winning_blocks(map_id, partition_id)?;
            for payload in blocks {
                let mut cursor = RecordCursor::new(payload);
                while let Some(record) = cursor.next_record()? {
                    *chunk_bytes += record.len();
                    chunk.push(record);
                    if *chunk_bytes >= self.opts.merge_size {
                        let full = std::mem::take(chunk);
                        *chunk_bytes = 0;
                        if tx.send(Ok(full)).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Blocks observed for one map attempt within one partition.
#[derive(Default)]
struct AttemptBlocks {
    /// Data blocks in arrival order as `(seq_no, payload)`.
    blocks: Vec<(u32, Bytes)>,
    seen: HashSet<u32>,
    /// Terminator seq_no, which equals the attempt's data block count.
    terminator: Option<u32>,
}

impl AttemptBlocks {
    fn add(&mut self, frame: BlockFrame) {
        if !self.seen.insert(frame.seq_no) {
            return;
        }
        if frame.is_terminator() {
            self.terminator = Some(frame.seq_no);
        } else {
            self.blocks.push((frame.seq_no, frame.payload));
        }
    }

    /// Seq_nos form an unbroken run from zero over the data blocks.
    fn contiguous(&self) -> bool {
        let mut seqs: Vec<u32> = self.blocks.iter().map(|(seq, _)| *seq).collect();
        seqs.sort_unstable();
        seqs.iter().enumerate().all(|(i, seq)| i as u32 == *seq)
    }

    fn complete(&self) -> bool {
        match self.terminator {
            Some(count) => self.blocks.len() as u32 == count && self.contiguous(),
            None => false,
        }
    }

    fn into_payloads(mut self) -> Vec<Bytes> {
        self.blocks.sort_by_key(|(seq, _)| *seq);
        self.blocks.into_iter().map(|(_, payload)| payload).collect()
    }
}

/// All attempts observed for one map within one partition.
#[derive(Default)]
struct MapAccumulator {
    attempts: HashMap<u16, AttemptBlocks>,
}

impl MapAccumulator {
    fn add(&mut self, frame: BlockFrame) {
        self.attempts
            .entry(frame.map_attempt)
            .or_default()
            .add(frame);
    }

    /// Resolves the winning attempt and returns its payloads in seq order.
    fn winning_blocks(self, map_id: u32, partition_id: u32) -> Result<Vec<Bytes>> {
        let mut attempts: Vec<(u16, AttemptBlocks)> =
            self.attempts.into_iter().collect();
        attempts.sort_by(|a, b| b.0.cmp(&a.0));

        let mut fallback: Option<(u16, AttemptBlocks)> = None;
        for (attempt, blocks) in attempts {
            if blocks.complete() {
                if fallback.is_some() {
                    debug!(
                        "Dropping superseded attempt blocks of map {map_id} \
                         in partition {partition_id}"
                    );
                }
                return Ok(blocks.into_payloads());
            }
            if fallback.is_none() && blocks.terminator.is_none() && blocks.contiguous()
            {
                fallback = Some((attempt, blocks));
            }
        }
        if let Some((attempt, blocks)) = fallback {
            warn!(
                "No terminated attempt for map {map_id} in partition {partition_id}; \
                 using contiguous attempt {attempt}"
            );
            return Ok(blocks.into_payloads());
        }
        Err(RssError::Corrupt(format!(
            "no complete map attempt for map {map_id} in partition {partition_id}"
        )))
    }
}

/// The reconstructed record stream handed to the host engine.
pub struct RecordStream {
    rx: mpsc::Receiver<Result<Vec<Bytes>>>,
    current: VecDeque<Bytes>,
}

impl RecordStream {
    /// Convenience for hosts that prefer pull over `Stream`.
    pub async fn next_record(&mut self) -> Option<Result<Bytes>> {
        futures::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }
}

impl Stream for RecordStream {
    type Item = Result<Bytes>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(record) = self.current.pop_front() {
                return Poll::Ready(Some(Ok(record)));
            }
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(batch))) => {
                    self.current.extend(batch);
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(attempt: u16, seq: u32, payload: &'static [u8]) -> BlockFrame {
        BlockFrame::new(1, attempt, seq, Bytes::from_static(payload))
    }

    #[test]
    fn duplicates_collapse_within_an_attempt() {
        let mut acc = MapAccumulator::default();
        acc.add(frame(0, 0, b"a"));
        acc.add(frame(0, 0, b"a"));
        acc.add(frame(0, 1, b"b"));
        acc.add(BlockFrame::terminator(1, 0, 2));
        let payloads = acc.winning_blocks(1, 0).unwrap();
        assert_eq!(payloads.len(), 2);
    }

    #[test]
    fn terminated_attempt_beats_unterminated_higher_attempt() {
        let mut acc = MapAccumulator::default();
        // Attempt 0 completed with a terminator.
        acc.add(frame(0, 0, b"committed"));
        acc.add(BlockFrame::terminator(1, 0, 1));
        // Attempt 1 left a contiguous but unterminated trail.
        acc.add(frame(1, 0, b"partial"));
        let payloads = acc.winning_blocks(1, 0).unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].as_ref(), b"committed");
    }

    #[test]
    fn highest_terminated_attempt_wins() {
        let mut acc = MapAccumulator::default();
        acc.add(frame(0, 0, b"old"));
        acc.add(BlockFrame::terminator(1, 0, 1));
        acc.add(frame(1, 0, b"new"));
        acc.add(BlockFrame::terminator(1, 1, 1));
        let payloads = acc.winning_blocks(1, 0).unwrap();
        assert_eq!(payloads[0].as_ref(), b"new");
    }

    #[test]
    fn incomplete_terminated_attempt_is_not_a_winner() {
        let mut acc = MapAccumulator::default();
        // Terminator claims 2 blocks; only seq 1 arrived.
        acc.add(frame(0, 1, b"tail"));
        acc.add(BlockFrame::terminator(1, 0, 2));
        assert!(acc.winning_blocks(1, 0).is_err());
    }

    #[test]
    fn payloads_come_back_in_seq_order() {
        let mut acc = MapAccumulator::default();
        acc.add(frame(0, 2, b"c"));
        acc.add(frame(0, 0, b"a"));
        acc.add(frame(0, 1, b"b"));
        acc.add(BlockFrame::terminator(1, 0, 3));
        let payloads = acc.winning_blocks(1, 0).unwrap();
        let joined: Vec<u8> = payloads.iter().flat_map(|p| p.to_vec()).collect();
        assert_eq!(joined, b"abc");
    }
}
