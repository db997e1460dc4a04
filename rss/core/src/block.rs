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

//! Self-delimiting block frames stored in partition part files.
//!
//! Every frame carries its idempotency fingerprint so part files tolerate
//! partial writes and re-deliveries; the reader validates checksums and
//! de-duplicates on `(map_id, map_attempt, seq_no)`. Layout, big-endian:
//!
//! ```text
//! [u32 length][u32 crc32][u32 map_id][u16 map_attempt][u32 seq_no][payload]
//! ```
//!
//! A zero-length frame is the terminator a writer emits once per
//! `(map attempt, partition)` on close; it marks that attempt's output for
//! the partition as complete.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, RssError};
use crate::ids::BlockFingerprint;

/// Frame header bytes preceding the payload.
pub const BLOCK_HEADER_LEN: usize = 18;

/// One framed block: the unit of transfer, buffering and deduplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockFrame {
    pub map_id: u32,
    pub map_attempt: u16,
    pub seq_no: u32,
    pub payload: Bytes,
}

impl BlockFrame {
    pub fn new(map_id: u32, map_attempt: u16, seq_no: u32, payload: Bytes) -> Self {
        Self {
            map_id,
            map_attempt,
            seq_no,
            payload,
        }
    }

    /// The end-of-output marker for one `(map attempt, partition)`.
    pub fn terminator(map_id: u32, map_attempt: u16, seq_no: u32) -> Self {
        Self::new(map_id, map_attempt, seq_no, Bytes::new())
    }

    pub fn is_terminator(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn fingerprint(&self) -> BlockFingerprint {
        BlockFingerprint {
            map_id: self.map_id,
            map_attempt: self.map_attempt,
            seq_no: self.seq_no,
        }
    }

    pub fn encoded_len(&self) -> usize {
        BLOCK_HEADER_LEN + self.payload.len()
    }

    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u32(self.payload.len() as u32);
        dst.put_u32(crc32fast::hash(&self.payload));
        dst.put_u32(self.map_id);
        dst.put_u16(self.map_attempt);
        dst.put_u32(self.seq_no);
        dst.put_slice(&self.payload);
    }

    /// Decodes the next frame off the front of `src`, advancing it.
    ///
    /// Returns `Ok(None)` at a clean end of input. Truncated headers,
    /// truncated payloads and checksum mismatches are `Corrupt` errors; a
    /// partially-written trailing frame therefore poisons only itself.
    pub fn decode(src: &mut Bytes) -> Result<Option<BlockFrame>> {
        if src.is_empty() {
            return Ok(None);
        }
        if src.len() < BLOCK_HEADER_LEN {
            return Err(RssError::Corrupt(format!(
                "truncated block header: {} bytes left",
                src.len()
            )));
        }
        let length = src.get_u32() as usize;
        let crc = src.get_u32();
        let map_id = src.get_u32();
        let map_attempt = src.get_u16();
        let seq_no = src.get_u32();
        if src.len() < length {
            return Err(RssError::Corrupt(format!(
                "truncated block payload: want {length} bytes, {} left",
                src.len()
            )));
        }
        let payload = src.split_to(length);
        let actual = crc32fast::hash(&payload);
        if actual != crc {
            return Err(RssError::Corrupt(format!(
                "block crc mismatch for map-{map_id}.{map_attempt} seq-{seq_no}: \
                 stored {crc:#010x}, computed {actual:#010x}"
            )));
        }
        Ok(Some(BlockFrame {
            map_id,
            map_attempt,
            seq_no,
            payload,
        }))
    }
}

/// Appends one length-prefixed record to a block payload under construction.
pub fn put_record(dst: &mut BytesMut, record: &[u8]) {
    dst.reserve(4 + record.len());
    dst.put_u32(record.len() as u32);
    dst.put_slice(record);
}

/// Size a record occupies inside a block payload.
pub fn record_len(record: &[u8]) -> usize {
    4 + record.len()
}

/// Iterates the length-prefixed records inside one block payload.
pub struct RecordCursor {
    payload: Bytes,
}

impl RecordCursor {
    pub fn new(payload: Bytes) -> Self {
        Self { payload }
    }

    pub fn next_record(&mut self) -> Result<Option<Bytes>> {
        if self.payload.is_empty() {
            return Ok(None);
        }
        if self.payload.len() < 4 {
            return Err(RssError::Corrupt(
                "truncated record length prefix".to_owned(),
            ));
        }
        let len = self.payload.get_u32() as usize;
        if self.payload.len() < len {
            return Err(RssError::Corrupt(format!(
                "truncated record: want {len} bytes, {} left",
                self.payload.len()
            )));
        }
        Ok(Some(self.payload.split_to(len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_consumes_multiple_frames() {
        let mut buf = BytesMut::new();
        BlockFrame::new(7, 0, 0, Bytes::from_static(b"first")).encode_into(&mut buf);
        BlockFrame::new(7, 0, 1, Bytes::from_static(b"second")).encode_into(&mut buf);
        BlockFrame::terminator(7, 0, 2).encode_into(&mut buf);

        let mut src = buf.freeze();
        let a = BlockFrame::decode(&mut src).unwrap().unwrap();
        assert_eq!(a.payload.as_ref(), b"first");
        let b = BlockFrame::decode(&mut src).unwrap().unwrap();
        assert_eq!(b.seq_no, 1);
        let t = BlockFrame::decode(&mut src).unwrap().unwrap();
        assert!(t.is_terminator());
        assert!(BlockFrame::decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn corrupt_payload_is_detected() {
        let mut buf = BytesMut::new();
        BlockFrame::new(1, 0, 0, Bytes::from_static(b"payload")).encode_into(&mut buf);
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        let mut src = buf.freeze();
        assert!(matches!(
            BlockFrame::decode(&mut src),
            Err(RssError::Corrupt(_))
        ));
    }

    #[test]
    fn truncated_frame_is_detected() {
        let mut buf = BytesMut::new();
        BlockFrame::new(1, 0, 0, Bytes::from_static(b"payload")).encode_into(&mut buf);
        let mut src = buf.freeze().slice(..BLOCK_HEADER_LEN + 3);
        assert!(matches!(
            BlockFrame::decode(&mut src),
            Err(RssError::Corrupt(_))
        ));
    }

    #[test]
    fn record_cursor_walks_payload() {
        let mut payload = BytesMut::new();
        put_record(&mut payload, b"one");
        put_record(&mut payload, b"");
        put_record(&mut payload, b"three");

        let mut cursor = RecordCursor::new(payload.freeze());
        assert_eq!(cursor.next_record().unwrap().unwrap().as_ref(), b"one");
        assert_eq!(cursor.next_record().unwrap().unwrap().as_ref(), b"");
        assert_eq!(cursor.next_record().unwrap().unwrap().as_ref(), b"three");
        assert!(cursor.next_record().unwrap().is_none());
    }
}
