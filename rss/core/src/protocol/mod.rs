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

//! The length-prefixed request/response wire protocol.
//!
//! Two channels exist per worker: the *control* channel (connection
//! establishment and token issuance) and the *data* channel (block uploads,
//! stage finalize, health). The master speaks the same framing on its
//! control port for allocation. Every request carries a 16-byte request id
//! and a deadline; every reply echoes the id and carries an [`ErrorKind`].
//!
//! Data-plane bodies are raw big-endian fields plus payload bytes.
//! Control-plane bodies (worker lists, cluster conf) are JSON.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cluster::{ClusterConf, WorkerDetail};
use crate::error::{Result, RssError};
use crate::ids::StageShuffleId;

pub mod codec;

/// Message kinds on the wire. Replies are `request kind | REPLY_BIT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    OpenConnection = 1,
    DataHandshake = 2,
    SendBlock = 3,
    FinalizeStage = 4,
    HealthCheck = 5,
    GetShuffleWorkers = 6,
}

impl MessageKind {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(MessageKind::OpenConnection),
            2 => Ok(MessageKind::DataHandshake),
            3 => Ok(MessageKind::SendBlock),
            4 => Ok(MessageKind::FinalizeStage),
            5 => Ok(MessageKind::HealthCheck),
            6 => Ok(MessageKind::GetShuffleWorkers),
            other => Err(RssError::Protocol(format!(
                "unknown message kind {other}"
            ))),
        }
    }
}

/// Error kinds carried in reply frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorKind {
    Ok = 0,
    NoShuffleWorkers = 1,
    NoToken = 2,
    Backpressure = 3,
    DuplicateBlock = 4,
    InputNotReady = 5,
    Dfs = 6,
    StageAborted = 7,
    Config = 8,
    Protocol = 9,
    Expired = 10,
    Internal = 11,
}

impl ErrorKind {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(ErrorKind::Ok),
            1 => Ok(ErrorKind::NoShuffleWorkers),
            2 => Ok(ErrorKind::NoToken),
            3 => Ok(ErrorKind::Backpressure),
            4 => Ok(ErrorKind::DuplicateBlock),
            5 => Ok(ErrorKind::InputNotReady),
            6 => Ok(ErrorKind::Dfs),
            7 => Ok(ErrorKind::StageAborted),
            8 => Ok(ErrorKind::Config),
            9 => Ok(ErrorKind::Protocol),
            10 => Ok(ErrorKind::Expired),
            11 => Ok(ErrorKind::Internal),
            other => Err(RssError::Protocol(format!("unknown error kind {other}"))),
        }
    }
}

/// A decoded request frame.
#[derive(Debug, Clone)]
pub struct Request {
    pub kind: MessageKind,
    pub request_id: Uuid,
    /// Epoch millis after which the server drops the request unprocessed.
    pub deadline_ms: u64,
    pub body: Bytes,
}

impl Request {
    pub fn new(kind: MessageKind, deadline_ms: u64, body: Bytes) -> Self {
        Self {
            kind,
            request_id: Uuid::new_v4(),
            deadline_ms,
            body,
        }
    }

    pub fn expired(&self, now_ms: u64) -> bool {
        now_ms > self.deadline_ms
    }
}

/// A decoded reply frame.
#[derive(Debug, Clone)]
pub struct Reply {
    pub kind: MessageKind,
    pub request_id: Uuid,
    pub error: ErrorKind,
    pub message: String,
    pub body: Bytes,
}

impl Reply {
    pub fn ok(kind: MessageKind, request_id: Uuid, body: Bytes) -> Self {
        Self {
            kind,
            request_id,
            error: ErrorKind::Ok,
            message: String::new(),
            body,
        }
    }

    pub fn failure(kind: MessageKind, request_id: Uuid, err: &RssError) -> Self {
        Self {
            kind,
            request_id,
            error: err.wire_kind(),
            message: err.to_string(),
            body: Bytes::new(),
        }
    }

    /// Converts an error reply into a typed error; `Ok` replies pass through.
    pub fn into_result(self) -> Result<Reply> {
        match self.error {
            ErrorKind::Ok | ErrorKind::DuplicateBlock => Ok(self),
            kind => Err(RssError::from_wire(kind, self.message)),
        }
    }
}

fn put_str(dst: &mut BytesMut, s: &str) {
    dst.put_u16(s.len() as u16);
    dst.put_slice(s.as_bytes());
}

fn get_str(src: &mut Bytes) -> Result<String> {
    if src.len() < 2 {
        return Err(RssError::Protocol("truncated string length".to_owned()));
    }
    let len = src.get_u16() as usize;
    if src.len() < len {
        return Err(RssError::Protocol("truncated string".to_owned()));
    }
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| RssError::Protocol(format!("invalid utf8 string: {e}")))
}

fn need(src: &Bytes, bytes: usize, what: &str) -> Result<()> {
    if src.len() < bytes {
        return Err(RssError::Protocol(format!("truncated {what}")));
    }
    Ok(())
}

/// Control-channel connection establishment. The reply body is the issued
/// 16-byte token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConnectionRequest {
    pub app_id: String,
    pub app_attempt: String,
}

impl OpenConnectionRequest {
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::new();
        put_str(&mut dst, &self.app_id);
        put_str(&mut dst, &self.app_attempt);
        dst.freeze()
    }

    pub fn decode(mut src: Bytes) -> Result<Self> {
        Ok(Self {
            app_id: get_str(&mut src)?,
            app_attempt: get_str(&mut src)?,
        })
    }
}

pub fn encode_token(token: Uuid) -> Bytes {
    Bytes::copy_from_slice(token.as_bytes())
}

pub fn decode_token(src: &Bytes) -> Result<Uuid> {
    if src.len() != 16 {
        return Err(RssError::Protocol(format!(
            "token must be 16 bytes, got {}",
            src.len()
        )));
    }
    let mut raw = [0u8; 16];
    raw.copy_from_slice(src);
    Ok(Uuid::from_bytes(raw))
}

/// First frame on a data channel: proves the sender holds a control token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataHandshake {
    pub token: Uuid,
}

impl DataHandshake {
    pub fn encode(&self) -> Bytes {
        encode_token(self.token)
    }

    pub fn decode(src: Bytes) -> Result<Self> {
        Ok(Self {
            token: decode_token(&src)?,
        })
    }
}

/// One partitioned block upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendBlockRequest {
    pub stage: StageShuffleId,
    pub partition_id: u32,
    pub num_partitions: u32,
    pub map_id: u32,
    pub map_attempt: u16,
    pub seq_no: u32,
    /// True for the end-of-output marker of this (map attempt, partition).
    pub terminator: bool,
    pub payload: Bytes,
}

const SEND_BLOCK_FLAG_TERMINATOR: u8 = 0x01;

impl SendBlockRequest {
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(64 + self.payload.len());
        put_str(&mut dst, &self.stage.app_id);
        put_str(&mut dst, &self.stage.app_attempt);
        dst.put_u32(self.stage.stage_attempt);
        dst.put_u32(self.stage.shuffle_id);
        dst.put_u32(self.partition_id);
        dst.put_u32(self.num_partitions);
        dst.put_u32(self.map_id);
        dst.put_u16(self.map_attempt);
        dst.put_u32(self.seq_no);
        let flags = if self.terminator {
            SEND_BLOCK_FLAG_TERMINATOR
        } else {
            0
        };
        dst.put_u8(flags);
        dst.put_slice(&self.payload);
        dst.freeze()
    }

    pub fn decode(mut src: Bytes) -> Result<Self> {
        let app_id = get_str(&mut src)?;
        let app_attempt = get_str(&mut src)?;
        need(&src, 27, "block header")?;
        let stage_attempt = src.get_u32();
        let shuffle_id = src.get_u32();
        let partition_id = src.get_u32();
        let num_partitions = src.get_u32();
        let map_id = src.get_u32();
        let map_attempt = src.get_u16();
        let seq_no = src.get_u32();
        let flags = src.get_u8();
        let terminator = flags & SEND_BLOCK_FLAG_TERMINATOR != 0;
        if terminator && !src.is_empty() {
            return Err(RssError::Protocol(
                "terminator block carries a payload".to_owned(),
            ));
        }
        Ok(Self {
            stage: StageShuffleId::new(app_id, app_attempt, stage_attempt, shuffle_id),
            partition_id,
            num_partitions,
            map_id,
            map_attempt,
            seq_no,
            terminator,
            payload: src,
        })
    }
}

/// Block upload acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendBlockReply {
    /// The block's fingerprint had been seen before; it was not re-buffered.
    pub duplicate: bool,
}

impl SendBlockReply {
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(1);
        dst.put_u8(self.duplicate as u8);
        dst.freeze()
    }

    pub fn decode(mut src: Bytes) -> Result<Self> {
        need(&src, 1, "send block reply")?;
        Ok(Self {
            duplicate: src.get_u8() != 0,
        })
    }
}

/// Flush-everything order for one stage's partitions on this worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeStageRequest {
    pub stage: StageShuffleId,
}

impl FinalizeStageRequest {
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::new();
        put_str(&mut dst, &self.stage.app_id);
        put_str(&mut dst, &self.stage.app_attempt);
        dst.put_u32(self.stage.stage_attempt);
        dst.put_u32(self.stage.shuffle_id);
        dst.freeze()
    }

    pub fn decode(mut src: Bytes) -> Result<Self> {
        let app_id = get_str(&mut src)?;
        let app_attempt = get_str(&mut src)?;
        need(&src, 8, "finalize stage body")?;
        let stage_attempt = src.get_u32();
        let shuffle_id = src.get_u32();
        Ok(Self {
            stage: StageShuffleId::new(app_id, app_attempt, stage_attempt, shuffle_id),
        })
    }
}

/// Master allocation request. The caller derives `requested_count` from
/// `ceil(num_partitions / partition_count_per_shuffle_worker)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetShuffleWorkersRequest {
    pub data_center: String,
    pub cluster: String,
    pub app_id: String,
    pub dag_id: String,
    pub priority: i32,
    pub task_id: String,
    pub app_name: String,
    pub requested_count: usize,
}

impl GetShuffleWorkersRequest {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(src: Bytes) -> Result<Self> {
        Ok(serde_json::from_slice(&src)?)
    }
}

/// Master allocation reply: the ordered worker list and the cluster config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetShuffleWorkersReply {
    pub workers: Vec<WorkerDetail>,
    pub cluster_conf: ClusterConf,
}

impl GetShuffleWorkersReply {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(src: Bytes) -> Result<Self> {
        Ok(serde_json::from_slice(&src)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_block_round_trip() {
        let req = SendBlockRequest {
            stage: StageShuffleId::new("app-1", "1", 0, 4),
            partition_id: 3,
            num_partitions: 8,
            map_id: 7,
            map_attempt: 1,
            seq_no: 42,
            terminator: false,
            payload: Bytes::from_static(b"block bytes"),
        };
        let decoded = SendBlockRequest::decode(req.encode()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn terminator_must_be_empty() {
        let req = SendBlockRequest {
            stage: StageShuffleId::new("app-1", "1", 0, 4),
            partition_id: 0,
            num_partitions: 1,
            map_id: 0,
            map_attempt: 0,
            seq_no: 9,
            terminator: true,
            payload: Bytes::new(),
        };
        let encoded = req.encode();
        assert!(SendBlockRequest::decode(encoded).unwrap().terminator);

        // Hand-craft a terminator with a payload; the decoder must reject it.
        let mut bad = BytesMut::from(&req.encode()[..]);
        bad.put_slice(b"junk");
        assert!(SendBlockRequest::decode(bad.freeze()).is_err());
    }

    #[test]
    fn allocation_messages_round_trip() {
        let req = GetShuffleWorkersRequest {
            data_center: "dc1".to_owned(),
            cluster: "default".to_owned(),
            app_id: "app-1".to_owned(),
            dag_id: "dag-0".to_owned(),
            priority: 0,
            task_id: "t-1".to_owned(),
            app_name: "wordcount".to_owned(),
            requested_count: 4,
        };
        let decoded = GetShuffleWorkersRequest::decode(req.encode().unwrap()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn reply_error_mapping() {
        let id = Uuid::new_v4();
        let reply = Reply::failure(
            MessageKind::SendBlock,
            id,
            &RssError::Backpressure("over threshold".to_owned()),
        );
        assert_eq!(reply.error, ErrorKind::Backpressure);
        let err = reply.into_result().unwrap_err();
        assert!(err.is_retryable());
    }
}
