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

//! Bypass writer: direct per-partition byte buffering, no sort.
//!
//! The right strategy for narrow shuffles without map-side combine; each
//! partition accumulates records into its own buffer and seals a block as
//! soon as the buffer reaches `block.size`.

use bytes::BytesMut;

use rss_core::block::put_record;
use rss_core::config::RssConfig;
use rss_core::error::Result;

use super::{BlockPipeline, WriteStats};

pub struct BypassWriter {
    pipeline: BlockPipeline,
    buffers: Vec<BytesMut>,
    block_size: usize,
}

impl BypassWriter {
    pub(super) fn new(pipeline: BlockPipeline, config: &RssConfig) -> Self {
        let partitions = pipeline.handle.num_partitions as usize;
        Self {
            pipeline,
            buffers: vec![BytesMut::new(); partitions],
            block_size: config.block_size(),
        }
    }

    pub async fn write(&mut self, partition_id: u32, record: &[u8]) -> Result<()> {
        let buffer = &mut self.buffers[partition_id as usize];
        put_record(buffer, record);
        self.pipeline.note_records(1);
        if buffer.len() >= self.block_size {
            let payload = buffer.split().freeze();
            self.pipeline.submit(partition_id, payload).await?;
        }
        Ok(())
    }

    pub async fn close(mut self) -> Result<WriteStats> {
        for partition_id in 0..self.buffers.len() {
            if !self.buffers[partition_id].is_empty() {
                let payload = self.buffers[partition_id].split().freeze();
                self.pipeline.submit(partition_id as u32, payload).await?;
            }
        }
        self.pipeline.finish().await
    }
}
