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

//! Per-partition append buffer and its lifecycle.
//!
//! State machine per (stage, partition):
//! `Empty -> Buffering -> Flushing -> Closed`, with `Aborted` as the terminal
//! failure state. The first block opens the buffer; the dump policy moves
//! chunks into flight; finalize (or retention expiry) closes it. Closing is
//! idempotent, and blocks arriving after close are rejected by the caller.
//!
//! Blocks are kept already encoded in the part-file frame format, so a flush
//! is a plain split of the byte buffer and each part file is a concatenation
//! of self-delimiting frames.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use object_store::path::Path;

use rss_core::block::BlockFrame;

/// Lifecycle phase of one partition buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionPhase {
    Buffering,
    Flushing,
    Closed,
    Aborted,
}

/// One completed sequential DFS write.
#[derive(Debug, Clone)]
pub struct FlushRecord {
    pub path: Path,
    pub bytes: u64,
    pub crc: u32,
}

/// Outcome of appending one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Newly buffered; carries the total buffered bytes after the append.
    Appended { buffered: usize },
    /// Fingerprint already seen; nothing was buffered.
    Duplicate,
    /// The partition no longer accepts blocks.
    Rejected(PartitionPhase),
}

/// Seen seq_nos for one (map_id, map_attempt) within a partition.
///
/// Tracks a contiguous prefix plus out-of-order stragglers, so long runs of
/// in-order blocks stay O(1) in memory.
#[derive(Debug, Default)]
struct SeenSeqs {
    next_contiguous: u32,
    stragglers: HashSet<u32>,
    terminated: bool,
}

impl SeenSeqs {
    /// Records `seq`; false when it was already present.
    fn insert(&mut self, seq: u32) -> bool {
        if seq < self.next_contiguous || self.stragglers.contains(&seq) {
            return false;
        }
        if seq == self.next_contiguous {
            self.next_contiguous += 1;
            while self.stragglers.remove(&self.next_contiguous) {
                self.next_contiguous += 1;
            }
        } else {
            self.stragglers.insert(seq);
        }
        true
    }
}

pub struct PartitionBuffer {
    partition_id: u32,
    phase: PartitionPhase,
    buf: BytesMut,
    /// Flush chunks handed to a dumper and not yet completed.
    in_flight: usize,
    /// Monotonic per-partition flush counter; names the part files.
    flush_seq: u32,
    seen: HashMap<(u32, u16), SeenSeqs>,
    closing: bool,
    last_append: Instant,
    flushed: Vec<FlushRecord>,
}

impl PartitionBuffer {
    pub fn new(partition_id: u32) -> Self {
        Self {
            partition_id,
            phase: PartitionPhase::Buffering,
            buf: BytesMut::new(),
            in_flight: 0,
            flush_seq: 0,
            seen: HashMap::new(),
            closing: false,
            last_append: Instant::now(),
            flushed: Vec::new(),
        }
    }

    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    pub fn phase(&self) -> PartitionPhase {
        self.phase
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buf.len()
    }

    pub fn idle_since(&self) -> Instant {
        self.last_append
    }

    pub fn flush_records(&self) -> &[FlushRecord] {
        &self.flushed
    }

    pub fn append(&mut self, frame: &BlockFrame) -> AppendOutcome {
        match self.phase {
            PartitionPhase::Buffering | PartitionPhase::Flushing => {}
            other => return AppendOutcome::Rejected(other),
        }
        if self.closing {
            return AppendOutcome::Rejected(PartitionPhase::Closed);
        }

        let seen = self
            .seen
            .entry((frame.map_id, frame.map_attempt))
            .or_default();
        if !seen.insert(frame.seq_no) {
            return AppendOutcome::Duplicate;
        }
        if frame.is_terminator() {
            seen.terminated = true;
        }

        frame.encode_into(&mut self.buf);
        self.last_append = Instant::now();
        AppendOutcome::Appended {
            buffered: self.buf.len(),
        }
    }

    /// Takes the buffered bytes for a sequential write, if any, together
    /// with the flush sequence number that names the part file.
    pub fn take_chunk(&mut self) -> Option<(Bytes, u32)> {
        if self.buf.is_empty() {
            return None;
        }
        let chunk = self.buf.split().freeze();
        let seq = self.flush_seq;
        self.flush_seq += 1;
        self.in_flight += 1;
        self.phase = PartitionPhase::Flushing;
        Some((chunk, seq))
    }

    /// Marks the partition as closing: no further appends are accepted, and
    /// the phase settles to `Closed` once in-flight chunks complete.
    pub fn close(&mut self) {
        self.closing = true;
        if self.in_flight == 0 && !matches!(self.phase, PartitionPhase::Aborted) {
            self.phase = PartitionPhase::Closed;
        }
    }

    pub fn abort(&mut self) {
        self.phase = PartitionPhase::Aborted;
    }

    /// Records the completion of one flush chunk.
    pub fn complete_flush(&mut self, record: Option<FlushRecord>) {
        debug_assert!(self.in_flight > 0);
        self.in_flight = self.in_flight.saturating_sub(1);
        match record {
            Some(record) => {
                self.flushed.push(record);
                if self.in_flight == 0 && !matches!(self.phase, PartitionPhase::Aborted)
                {
                    self.phase = if self.closing {
                        PartitionPhase::Closed
                    } else {
                        PartitionPhase::Buffering
                    };
                }
            }
            None => {
                self.phase = PartitionPhase::Aborted;
            }
        }
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(map_id: u32, attempt: u16, seq: u32) -> BlockFrame {
        BlockFrame::new(map_id, attempt, seq, Bytes::from(vec![seq as u8; 8]))
    }

    fn record(seq: u32) -> FlushRecord {
        FlushRecord {
            path: Path::from(format!("part-{seq}")),
            bytes: 1,
            crc: 0,
        }
    }

    #[test]
    fn duplicate_blocks_are_suppressed() {
        let mut buffer = PartitionBuffer::new(0);
        assert!(matches!(
            buffer.append(&frame(7, 0, 3)),
            AppendOutcome::Appended { .. }
        ));
        assert_eq!(buffer.append(&frame(7, 0, 3)), AppendOutcome::Duplicate);
        // The same seq from a different attempt is a different block.
        assert!(matches!(
            buffer.append(&frame(7, 1, 3)),
            AppendOutcome::Appended { .. }
        ));
    }

    #[test]
    fn out_of_order_seqs_are_tracked() {
        let mut buffer = PartitionBuffer::new(0);
        for seq in [2u32, 0, 1, 5, 3] {
            assert!(matches!(
                buffer.append(&frame(1, 0, seq)),
                AppendOutcome::Appended { .. }
            ));
        }
        for seq in [2u32, 0, 1, 5, 3] {
            assert_eq!(buffer.append(&frame(1, 0, seq)), AppendOutcome::Duplicate);
        }
    }

    #[test]
    fn lifecycle_buffering_to_closed() {
        let mut buffer = PartitionBuffer::new(0);
        buffer.append(&frame(0, 0, 0));

        let (chunk, seq) = buffer.take_chunk().unwrap();
        assert!(!chunk.is_empty());
        assert_eq!(seq, 0);
        assert_eq!(buffer.phase(), PartitionPhase::Flushing);

        // More blocks may arrive while a chunk is in flight.
        buffer.append(&frame(0, 0, 1));
        buffer.complete_flush(Some(record(0)));
        assert_eq!(buffer.phase(), PartitionPhase::Buffering);

        buffer.close();
        let (_, seq) = buffer.take_chunk().unwrap();
        assert_eq!(seq, 1);
        buffer.complete_flush(Some(record(1)));
        assert_eq!(buffer.phase(), PartitionPhase::Closed);

        // Close is idempotent and later arrivals are rejected.
        buffer.close();
        assert_eq!(
            buffer.append(&frame(0, 0, 2)),
            AppendOutcome::Rejected(PartitionPhase::Closed)
        );
        assert_eq!(buffer.flush_records().len(), 2);
    }

    #[test]
    fn failed_flush_aborts_the_partition() {
        let mut buffer = PartitionBuffer::new(0);
        buffer.append(&frame(0, 0, 0));
        buffer.take_chunk().unwrap();
        buffer.complete_flush(None);
        assert_eq!(buffer.phase(), PartitionPhase::Aborted);
        assert!(matches!(
            buffer.append(&frame(0, 0, 1)),
            AppendOutcome::Rejected(PartitionPhase::Aborted)
        ));
    }

    #[test]
    fn empty_buffer_yields_no_chunk() {
        let mut buffer = PartitionBuffer::new(0);
        assert!(buffer.take_chunk().is_none());
        buffer.close();
        assert_eq!(buffer.phase(), PartitionPhase::Closed);
    }
}
