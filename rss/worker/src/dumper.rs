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

//! The dumper pool: converts in-memory partition chunks into sequential DFS
//! writes.
//!
//! A partition is sticky to one dumper (hash of partition id), so each
//! partition's part files are written by a single task in flush order and no
//! cross-task serialization is needed. Queues are bounded; a full queue
//! blocks the enqueuer, which is the upward backpressure path through the
//! memory governor.

use std::sync::Arc;

use bytes::Bytes;
use log::{debug, warn};
use object_store::ObjectStore;
use object_store::path::Path;
use tokio::sync::mpsc;

use rss_core::error::Result;
use rss_core::util::backoff_delay;

use crate::buffer::FlushRecord;
use crate::memory::MemoryGovernor;
use crate::storage::StageKey;

const FLUSH_RETRY_BASE_MS: u64 = 200;
const FLUSH_RETRY_CAP_MS: u64 = 10_000;

/// One chunk of a partition bound for the DFS.
pub struct FlushJob {
    pub key: StageKey,
    /// Stage attempt current when the chunk was taken; completions for a
    /// superseded attempt are dropped by the storage loop.
    pub stage_attempt: u32,
    pub partition_id: u32,
    pub path: Path,
    pub data: Bytes,
}

/// Completion report for one [`FlushJob`], in submission order per partition.
pub struct FlushOutcome {
    pub key: StageKey,
    pub stage_attempt: u32,
    pub partition_id: u32,
    /// The flush record on success; the final error rendered as text after
    /// retries were exhausted.
    pub result: std::result::Result<FlushRecord, String>,
}

pub struct DumperPool {
    senders: Vec<mpsc::Sender<FlushJob>>,
}

impl DumperPool {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        governor: Arc<MemoryGovernor>,
        threads: usize,
        queue_size: usize,
        retries: usize,
        completions: mpsc::Sender<FlushOutcome>,
    ) -> Self {
        let threads = threads.max(1);
        let mut senders = Vec::with_capacity(threads);
        for dumper_id in 0..threads {
            let (tx, rx) = mpsc::channel(queue_size.max(1));
            senders.push(tx);
            tokio::spawn(run_dumper(
                dumper_id,
                rx,
                store.clone(),
                governor.clone(),
                retries,
                completions.clone(),
            ));
        }
        Self { senders }
    }

    /// Enqueues a chunk on the partition's sticky dumper, waiting when the
    /// queue is full.
    pub async fn submit(&self, job: FlushJob) -> Result<()> {
        let idx = sticky_dumper(job.partition_id, self.senders.len());
        self.senders[idx].send(job).await.map_err(|_| {
            rss_core::error::RssError::Internal("dumper pool stopped".to_owned())
        })
    }
}

/// Sticky dumper index for a partition.
fn sticky_dumper(partition_id: u32, dumpers: usize) -> usize {
    ((partition_id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize % dumpers
}

async fn run_dumper(
    dumper_id: usize,
    mut rx: mpsc::Receiver<FlushJob>,
    store: Arc<dyn ObjectStore>,
    governor: Arc<MemoryGovernor>,
    retries: usize,
    completions: mpsc::Sender<FlushOutcome>,
) {
    debug!("Dumper {dumper_id} started");
    while let Some(job) = rx.recv().await {
        let size = job.data.len() as u64;
        let crc = crc32fast::hash(&job.data);

        let mut result = Err("flush not attempted".to_owned());
        for attempt in 0..=retries {
            match store.put(&job.path, job.data.clone().into()).await {
                Ok(_) => {
                    result = Ok(FlushRecord {
                        path: job.path.clone(),
                        bytes: size,
                        crc,
                    });
                    break;
                }
                Err(e) => {
                    let failure = format!("flush of {} failed: {e}", job.path);
                    if attempt == retries {
                        warn!(
                            "Dumper {dumper_id}: {failure}; retries exhausted, \
                             aborting partition {}",
                            job.partition_id
                        );
                        result = Err(failure);
                    } else {
                        let delay =
                            backoff_delay(attempt, FLUSH_RETRY_BASE_MS, FLUSH_RETRY_CAP_MS);
                        warn!(
                            "Dumper {dumper_id}: {failure}; retrying in {} ms",
                            delay.as_millis()
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        // The chunk leaves resident memory whether or not it was written;
        // an aborted partition stops accepting blocks anyway.
        governor.release(size);

        let outcome = FlushOutcome {
            key: job.key,
            stage_attempt: job.stage_attempt,
            partition_id: job.partition_id,
            result,
        };
        if completions.send(outcome).await.is_err() {
            break;
        }
    }
    debug!("Dumper {dumper_id} stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use rss_core::ids::StageShuffleId;

    fn key() -> StageKey {
        StageKey::from(&StageShuffleId::new("app-1", "1", 0, 0))
    }

    #[tokio::test]
    async fn flushes_land_and_release_memory() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let governor = Arc::new(MemoryGovernor::new(1024, 0.75));
        let (tx, mut rx) = mpsc::channel(8);
        let pool = DumperPool::new(store.clone(), governor.clone(), 2, 4, 1, tx);

        let data = Bytes::from_static(b"chunk bytes");
        assert!(governor.try_reserve(data.len() as u64));
        pool.submit(FlushJob {
            key: key(),
            stage_attempt: 0,
            partition_id: 3,
            path: Path::from("app-1/1/0/stage-0/partition-3/part-w-00000"),
            data: data.clone(),
        })
        .await
        .unwrap();

        let outcome = rx.recv().await.unwrap();
        let record = outcome.result.unwrap();
        assert_eq!(record.bytes, data.len() as u64);
        assert_eq!(governor.used(), 0);

        let stored = store.get(&record.path).await.unwrap().bytes().await.unwrap();
        assert_eq!(stored, data);
    }

    #[test]
    fn sticky_dumper_is_deterministic() {
        for p in 0..64u32 {
            assert_eq!(sticky_dumper(p, 4), sticky_dumper(p, 4));
            assert!(sticky_dumper(p, 4) < 4);
        }
    }
}
