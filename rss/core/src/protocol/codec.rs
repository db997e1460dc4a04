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

//! Frame codec for the wire protocol.
//!
//! Request frame: `[u32 length][u8 kind][16B request id][u64 deadline][body]`
//! Reply frame:   `[u32 length][u8 kind][16B request id][u8 error]
//!                 [u16 message len][message][body]`
//!
//! The leading length counts everything after itself. Frames larger than the
//! configured maximum are a `ProtocolError` on both ends.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{Result, RssError};
use crate::protocol::{ErrorKind, MessageKind, Reply, Request};

const REQUEST_HEADER_LEN: usize = 1 + 16 + 8;
const REPLY_HEADER_LEN: usize = 1 + 16 + 1 + 2;

/// A framed protocol stream over any async byte stream.
pub struct FramedStream<S> {
    inner: S,
    max_frame_size: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FramedStream<S> {
    pub fn new(inner: S, max_frame_size: usize) -> Self {
        Self {
            inner,
            max_frame_size,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(None);
            }
            Err(e) => return Err(RssError::IoError(e)),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > self.max_frame_size {
            return Err(RssError::Protocol(format!(
                "frame of {len} bytes exceeds the {} byte limit",
                self.max_frame_size
            )));
        }
        let mut frame = vec![0u8; len];
        self.inner
            .read_exact(&mut frame)
            .await
            .map_err(RssError::IoError)?;
        Ok(Some(Bytes::from(frame)))
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        if frame.len() > self.max_frame_size {
            return Err(RssError::Protocol(format!(
                "outgoing frame of {} bytes exceeds the {} byte limit",
                frame.len(),
                self.max_frame_size
            )));
        }
        let mut out = BytesMut::with_capacity(4 + frame.len());
        out.put_u32(frame.len() as u32);
        out.put_slice(frame);
        self.inner
            .write_all(&out)
            .await
            .map_err(RssError::IoError)?;
        self.inner.flush().await.map_err(RssError::IoError)?;
        Ok(())
    }

    pub async fn write_request(&mut self, request: &Request) -> Result<()> {
        let mut frame = BytesMut::with_capacity(REQUEST_HEADER_LEN + request.body.len());
        frame.put_u8(request.kind as u8);
        frame.put_slice(request.request_id.as_bytes());
        frame.put_u64(request.deadline_ms);
        frame.put_slice(&request.body);
        self.write_frame(&frame).await
    }

    /// Reads the next request. `Ok(None)` on clean connection close.
    pub async fn read_request(&mut self) -> Result<Option<Request>> {
        let Some(mut frame) = self.read_frame().await? else {
            return Ok(None);
        };
        if frame.len() < REQUEST_HEADER_LEN {
            return Err(RssError::Protocol(format!(
                "request frame too short: {} bytes",
                frame.len()
            )));
        }
        let kind = MessageKind::from_u8(frame.get_u8())?;
        let mut id = [0u8; 16];
        frame.copy_to_slice(&mut id);
        let deadline_ms = frame.get_u64();
        Ok(Some(Request {
            kind,
            request_id: Uuid::from_bytes(id),
            deadline_ms,
            body: frame,
        }))
    }

    pub async fn write_reply(&mut self, reply: &Reply) -> Result<()> {
        let mut frame = BytesMut::with_capacity(
            REPLY_HEADER_LEN + reply.message.len() + reply.body.len(),
        );
        frame.put_u8(reply.kind as u8);
        frame.put_slice(reply.request_id.as_bytes());
        frame.put_u8(reply.error as u8);
        frame.put_u16(reply.message.len() as u16);
        frame.put_slice(reply.message.as_bytes());
        frame.put_slice(&reply.body);
        self.write_frame(&frame).await
    }

    /// Reads the next reply. A closed connection mid-exchange is an error.
    pub async fn read_reply(&mut self) -> Result<Reply> {
        let Some(mut frame) = self.read_frame().await? else {
            return Err(RssError::Connection(
                "connection closed while awaiting reply".to_owned(),
            ));
        };
        if frame.len() < REPLY_HEADER_LEN {
            return Err(RssError::Protocol(format!(
                "reply frame too short: {} bytes",
                frame.len()
            )));
        }
        let kind = MessageKind::from_u8(frame.get_u8())?;
        let mut id = [0u8; 16];
        frame.copy_to_slice(&mut id);
        let error = ErrorKind::from_u8(frame.get_u8())?;
        let message_len = frame.get_u16() as usize;
        if frame.len() < message_len {
            return Err(RssError::Protocol("truncated reply message".to_owned()));
        }
        let message = String::from_utf8(frame.split_to(message_len).to_vec())
            .map_err(|e| RssError::Protocol(format!("invalid reply message: {e}")))?;
        Ok(Reply {
            kind,
            request_id: Uuid::from_bytes(id),
            error,
            message,
            body: frame,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_reply_exchange() {
        let (client, server) = tokio::io::duplex(4096);
        let mut client = FramedStream::new(client, 1 << 20);
        let mut server = FramedStream::new(server, 1 << 20);

        let request = Request::new(
            MessageKind::HealthCheck,
            1234,
            Bytes::from_static(b"ping"),
        );
        client.write_request(&request).await.unwrap();

        let received = server.read_request().await.unwrap().unwrap();
        assert_eq!(received.kind, MessageKind::HealthCheck);
        assert_eq!(received.request_id, request.request_id);
        assert_eq!(received.deadline_ms, 1234);
        assert_eq!(received.body.as_ref(), b"ping");

        let reply = Reply::ok(
            received.kind,
            received.request_id,
            Bytes::from_static(b"pong"),
        );
        server.write_reply(&reply).await.unwrap();

        let got = client.read_reply().await.unwrap();
        assert_eq!(got.error, ErrorKind::Ok);
        assert_eq!(got.request_id, request.request_id);
        assert_eq!(got.body.as_ref(), b"pong");
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (client, server) = tokio::io::duplex(4096);
        let mut client = FramedStream::new(client, 1 << 20);
        let mut server = FramedStream::new(server, 16);

        let request =
            Request::new(MessageKind::SendBlock, 0, Bytes::from(vec![0u8; 128]));
        client.write_request(&request).await.unwrap();

        let err = server.read_request().await.unwrap_err();
        assert!(matches!(err, RssError::Protocol(_)));
    }

    #[tokio::test]
    async fn clean_close_yields_none() {
        let (client, server) = tokio::io::duplex(4096);
        drop(client);
        let mut server = FramedStream::new(server, 1 << 20);
        assert!(server.read_request().await.unwrap().is_none());
    }
}
