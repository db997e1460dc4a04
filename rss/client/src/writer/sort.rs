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

//! Sort writer: buffer records in memory sorted by partition, spill runs to
//! a local staging directory once `writer.buffer.spill` is exceeded, and
//! merge-emit per partition at close.
//!
//! Each spill run is a single sequential file of length-prefixed records in
//! partition order, described by an in-memory offset table with
//! `num_partitions + 1` entries; partition `p` of a run spans
//! `offsets[p]..offsets[p + 1]`. The merge walks partitions in order,
//! concatenating each run's slice (oldest run first) and then the in-memory
//! leftovers, which preserves record order per partition.

use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use bytes::{Bytes, BytesMut};
use log::debug;
use tempfile::TempDir;

use rss_core::config::RssConfig;
use rss_core::error::{Result, RssError};

use super::{BlockPipeline, WriteStats};

struct SpillRun {
    path: PathBuf,
    /// Byte offsets per partition; length is `num_partitions + 1` with the
    /// final entry being the run length.
    offsets: Vec<u64>,
}

pub struct SortWriter {
    pipeline: BlockPipeline,
    num_partitions: usize,
    block_size: usize,
    spill_threshold: usize,
    records: Vec<(u32, Bytes)>,
    buffered_bytes: usize,
    staging: TempDir,
    runs: Vec<SpillRun>,
}

impl SortWriter {
    pub(super) fn new(pipeline: BlockPipeline, config: &RssConfig) -> Result<Self> {
        let staging = TempDir::new().map_err(RssError::IoError)?;
        Ok(Self {
            num_partitions: pipeline.handle.num_partitions as usize,
            pipeline,
            block_size: config.block_size(),
            spill_threshold: config.writer_buffer_spill().max(1 << 12),
            records: Vec::new(),
            buffered_bytes: 0,
            staging,
            runs: Vec::new(),
        })
    }

    pub async fn write(&mut self, partition_id: u32, record: &[u8]) -> Result<()> {
        self.records
            .push((partition_id, Bytes::copy_from_slice(record)));
        self.buffered_bytes += record.len() + 4;
        self.pipeline.note_records(1);
        if self.buffered_bytes >= self.spill_threshold {
            self.spill()?;
        }
        Ok(())
    }

    /// Writes the buffered records to one partition-ordered run file.
    fn spill(&mut self) -> Result<()> {
        if self.records.is_empty() {
            return Ok(());
        }
        // Stable: record order within a partition survives the sort.
        self.records.sort_by_key(|(partition, _)| *partition);

        let path = self
            .staging
            .path()
            .join(format!("run-{}.data", self.runs.len()));
        let file = File::create(&path).map_err(RssError::IoError)?;
        let mut writer = BufWriter::new(file);

        let mut offsets = vec![0u64; self.num_partitions + 1];
        let mut written = 0u64;
        let mut cursor = 0usize;
        for partition in 0..self.num_partitions {
            offsets[partition] = written;
            while cursor < self.records.len()
                && self.records[cursor].0 as usize == partition
            {
                let record = &self.records[cursor].1;
                writer
                    .write_all(&(record.len() as u32).to_be_bytes())
                    .map_err(RssError::IoError)?;
                writer.write_all(record).map_err(RssError::IoError)?;
                written += 4 + record.len() as u64;
                cursor += 1;
            }
        }
        offsets[self.num_partitions] = written;
        writer.flush().map_err(RssError::IoError)?;

        debug!(
            "Spilled {} records ({} bytes) to {:?}",
            self.records.len(),
            written,
            path
        );
        self.runs.push(SpillRun { path, offsets });
        self.records.clear();
        self.buffered_bytes = 0;
        Ok(())
    }

    /// Reads one partition's slice out of a run file.
    fn read_run_slice(run: &SpillRun, partition: usize) -> Result<Vec<u8>> {
        let start = run.offsets[partition];
        let end = run.offsets[partition + 1];
        let mut data = vec![0u8; (end - start) as usize];
        if data.is_empty() {
            return Ok(data);
        }
        let mut file = File::open(&run.path).map_err(RssError::IoError)?;
        file.seek(SeekFrom::Start(start)).map_err(RssError::IoError)?;
        file.read_exact(&mut data).map_err(RssError::IoError)?;
        Ok(data)
    }

    pub async fn close(mut self) -> Result<WriteStats> {
        // Leftovers become the final (in-memory) run of the merge.
        self.records.sort_by_key(|(partition, _)| *partition);

        let mut block = BytesMut::new();
        for partition in 0..self.num_partitions {
            // Spilled runs first, oldest first, then the in-memory tail.
            for run in &self.runs {
                let slice = Self::read_run_slice(run, partition)?;
                let mut rest = &slice[..];
                while !rest.is_empty() {
                    let take = rest.len().min(self.block_size.max(1));
                    // Cut at a record boundary: records are self-delimiting,
                    // so walk prefixes until the budget is spent.
                    let cut = record_aligned_cut(rest, take)?;
                    block.extend_from_slice(&rest[..cut]);
                    rest = &rest[cut..];
                    if block.len() >= self.block_size {
                        self.pipeline
                            .submit(partition as u32, block.split().freeze())
                            .await?;
                    }
                }
            }
            let start = self
                .records
                .partition_point(|(p, _)| (*p as usize) < partition);
            let end = self
                .records
                .partition_point(|(p, _)| (*p as usize) <= partition);
            for (_, record) in &self.records[start..end] {
                block.extend_from_slice(&(record.len() as u32).to_be_bytes());
                block.extend_from_slice(record);
                if block.len() >= self.block_size {
                    self.pipeline
                        .submit(partition as u32, block.split().freeze())
                        .await?;
                }
            }
            if !block.is_empty() {
                self.pipeline
                    .submit(partition as u32, block.split().freeze())
                    .await?;
            }
        }
        self.pipeline.finish().await
    }
}

/// Largest record-aligned cut within `budget` bytes (at least one record).
fn record_aligned_cut(data: &[u8], budget: usize) -> Result<usize> {
    let mut cut = 0usize;
    while cut < data.len() {
        if data.len() - cut < 4 {
            return Err(RssError::Internal(
                "spill run ends inside a record prefix".to_owned(),
            ));
        }
        let len =
            u32::from_be_bytes([data[cut], data[cut + 1], data[cut + 2], data[cut + 3]])
                as usize;
        let next = cut + 4 + len;
        if next > data.len() {
            return Err(RssError::Internal(
                "spill run ends inside a record".to_owned(),
            ));
        }
        if cut > 0 && next > budget {
            break;
        }
        cut = next;
        if cut >= budget {
            break;
        }
    }
    Ok(cut)
}
