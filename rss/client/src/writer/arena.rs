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

//! Arena writer for relocatable serialized records (the `unsafe` strategy).
//!
//! Records land once in a flat byte arena with `(partition, offset, len)`
//! position entries on the side. A counting sort over the entries groups
//! positions by partition without moving any record bytes; emission copies
//! each record exactly once into its outgoing block. The arena drains
//! whenever it reaches the configured memory threshold.

use bytes::BytesMut;

use rss_core::config::RssConfig;
use rss_core::error::Result;

use super::{BlockPipeline, WriteStats};

#[derive(Clone, Copy)]
struct PositionEntry {
    partition_id: u32,
    /// Offset of the record's length prefix within the arena.
    offset: u32,
    /// Prefix plus payload length.
    len: u32,
}

pub struct ArenaWriter {
    pipeline: BlockPipeline,
    num_partitions: usize,
    block_size: usize,
    memory_threshold: usize,
    arena: Vec<u8>,
    entries: Vec<PositionEntry>,
    /// Scratch for the counting sort, `num_partitions + 1` slots.
    partition_starts: Vec<usize>,
}

impl ArenaWriter {
    pub(super) fn new(pipeline: BlockPipeline, config: &RssConfig) -> Self {
        let num_partitions = pipeline.handle.num_partitions as usize;
        Self {
            pipeline,
            num_partitions,
            block_size: config.block_size(),
            memory_threshold: config.memory_threshold().max(1 << 16),
            arena: Vec::new(),
            entries: Vec::new(),
            partition_starts: vec![0; num_partitions + 1],
        }
    }

    pub async fn write(&mut self, partition_id: u32, record: &[u8]) -> Result<()> {
        let encoded = 4 + record.len();
        if !self.arena.is_empty() && self.arena.len() + encoded > self.memory_threshold
        {
            self.drain().await?;
        }
        let offset = self.arena.len() as u32;
        self.arena
            .extend_from_slice(&(record.len() as u32).to_be_bytes());
        self.arena.extend_from_slice(record);
        self.entries.push(PositionEntry {
            partition_id,
            offset,
            len: encoded as u32,
        });
        self.pipeline.note_records(1);
        Ok(())
    }

    /// Counting sort of position entries by partition: count, prefix-sum,
    /// then place each entry into its partition's slice.
    fn sorted_entries(&mut self) -> Vec<PositionEntry> {
        self.partition_starts.truncate(0);
        self.partition_starts.resize(self.num_partitions + 1, 0);
        for entry in &self.entries {
            self.partition_starts[entry.partition_id as usize] += 1;
        }

        let mut sum = 0;
        for start in self.partition_starts.iter_mut() {
            sum += *start;
            *start = sum;
        }

        let placeholder = PositionEntry {
            partition_id: 0,
            offset: 0,
            len: 0,
        };
        let mut sorted = vec![placeholder; self.entries.len()];
        // Reverse placement keeps entries of a partition in arrival order.
        for entry in self.entries.iter().rev() {
            let slot = &mut self.partition_starts[entry.partition_id as usize];
            *slot -= 1;
            sorted[*slot] = *entry;
        }
        sorted
    }

    async fn drain(&mut self) -> Result<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        let sorted = self.sorted_entries();

        let mut current_partition = sorted[0].partition_id;
        let mut block = BytesMut::new();
        for entry in sorted {
            if entry.partition_id != current_partition && !block.is_empty() {
                self.pipeline
                    .submit(current_partition, block.split().freeze())
                    .await?;
            }
            current_partition = entry.partition_id;

            let start = entry.offset as usize;
            let end = start + entry.len as usize;
            block.extend_from_slice(&self.arena[start..end]);
            if block.len() >= self.block_size {
                self.pipeline
                    .submit(current_partition, block.split().freeze())
                    .await?;
            }
        }
        if !block.is_empty() {
            self.pipeline
                .submit(current_partition, block.freeze())
                .await?;
        }

        self.arena.clear();
        self.entries.clear();
        Ok(())
    }

    pub async fn close(mut self) -> Result<WriteStats> {
        self.drain().await?;
        self.pipeline.finish().await
    }
}
