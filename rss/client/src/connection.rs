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

//! Client connections to masters and workers.
//!
//! Every call carries a deadline; replies are matched to requests by id and
//! error replies are converted back into typed errors. Establishing a
//! worker connection is two steps: obtain a flow-control token on the
//! control port (which may park until a token frees or the deadline lapses),
//! then handshake the data connection with it. The token returns to the
//! worker's pool when the data connection drops.

use std::time::Duration;

use bytes::Bytes;
use log::debug;
use tokio::net::TcpStream;
use uuid::Uuid;

use rss_core::cluster::WorkerDetail;
use rss_core::config::RssConfig;
use rss_core::error::{Result, RssError};
use rss_core::ids::StageShuffleId;
use rss_core::protocol::codec::FramedStream;
use rss_core::protocol::{
    DataHandshake, FinalizeStageRequest, GetShuffleWorkersReply,
    GetShuffleWorkersRequest, MessageKind, Reply, Request, SendBlockReply,
    SendBlockRequest, OpenConnectionRequest, decode_token,
};
use rss_core::util::timestamp_millis;

/// Network knobs shared by every client-side connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub network_timeout: Duration,
    pub network_retries: usize,
    pub max_request_size: usize,
}

impl ConnectOptions {
    pub fn from_config(config: &RssConfig) -> Self {
        Self {
            network_timeout: Duration::from_millis(config.network_timeout_millis()),
            network_retries: config.network_retries(),
            max_request_size: config.max_request_size(),
        }
    }
}

async fn connect_tcp(addr: &str) -> Result<TcpStream> {
    TcpStream::connect(addr)
        .await
        .map_err(|e| RssError::Connection(format!("cannot connect to {addr}: {e}")))
}

/// One request/reply exchange with a deadline, matching ids.
async fn exchange(
    framed: &mut FramedStream<TcpStream>,
    kind: MessageKind,
    body: Bytes,
    timeout: Duration,
) -> Result<Reply> {
    let request = Request::new(
        kind,
        timestamp_millis() + timeout.as_millis() as u64,
        body,
    );
    framed.write_request(&request).await?;
    let reply = tokio::time::timeout(timeout, framed.read_reply()).await??;
    if reply.request_id != request.request_id {
        return Err(RssError::Protocol(format!(
            "reply id {} does not match request id {}",
            reply.request_id, request.request_id
        )));
    }
    reply.into_result()
}

/// Client for the master's control endpoint.
pub struct MasterClient {
    framed: FramedStream<TcpStream>,
    opts: ConnectOptions,
}

impl MasterClient {
    pub async fn connect(addr: &str, opts: &ConnectOptions) -> Result<Self> {
        debug!("MasterClient connecting to {addr}");
        let stream = connect_tcp(addr).await?;
        Ok(Self {
            framed: FramedStream::new(stream, opts.max_request_size),
            opts: opts.clone(),
        })
    }

    pub async fn get_shuffle_workers(
        &mut self,
        request: &GetShuffleWorkersRequest,
    ) -> Result<GetShuffleWorkersReply> {
        let reply = exchange(
            &mut self.framed,
            MessageKind::GetShuffleWorkers,
            request.encode()?,
            self.opts.network_timeout,
        )
        .await?;
        GetShuffleWorkersReply::decode(reply.body)
    }

    pub async fn health_check(&mut self) -> Result<()> {
        exchange(
            &mut self.framed,
            MessageKind::HealthCheck,
            Bytes::new(),
            self.opts.network_timeout,
        )
        .await
        .map(|_| ())
    }
}

/// A tokened data connection to one worker.
pub struct WorkerConnection {
    data: FramedStream<TcpStream>,
    pub token: Uuid,
    opts: ConnectOptions,
}

impl WorkerConnection {
    pub async fn connect(
        worker: &WorkerDetail,
        app_id: &str,
        app_attempt: &str,
        opts: &ConnectOptions,
    ) -> Result<Self> {
        // Control channel: token issuance. The control connection is not
        // needed afterwards; the token lives until the data channel drops.
        let control = connect_tcp(&worker.control_addr()).await?;
        let mut control = FramedStream::new(control, opts.max_request_size);
        let open = OpenConnectionRequest {
            app_id: app_id.to_owned(),
            app_attempt: app_attempt.to_owned(),
        };
        let reply = exchange(
            &mut control,
            MessageKind::OpenConnection,
            open.encode(),
            opts.network_timeout,
        )
        .await?;
        let token = decode_token(&reply.body)?;

        // Data channel: prove the token.
        let data = connect_tcp(&worker.data_addr()).await?;
        let mut data = FramedStream::new(data, opts.max_request_size);
        exchange(
            &mut data,
            MessageKind::DataHandshake,
            DataHandshake { token }.encode(),
            opts.network_timeout,
        )
        .await?;

        debug!(
            "Connected to worker {} with token {token}",
            worker.name()
        );
        Ok(Self {
            data,
            token,
            opts: opts.clone(),
        })
    }

    /// Sends one block and awaits its ack. A `true` return means the worker
    /// had already seen this block's fingerprint. Single attempt; retry
    /// policy lives with the caller.
    pub async fn send_block(&mut self, request: &SendBlockRequest) -> Result<bool> {
        let reply = exchange(
            &mut self.data,
            MessageKind::SendBlock,
            request.encode(),
            self.opts.network_timeout,
        )
        .await?;
        Ok(SendBlockReply::decode(reply.body)?.duplicate)
    }

    /// Orders the worker to flush and close all partitions of the stage,
    /// returning once everything it buffered is durable.
    pub async fn finalize_stage(&mut self, stage: &StageShuffleId) -> Result<()> {
        let request = FinalizeStageRequest {
            stage: stage.clone(),
        };
        exchange(
            &mut self.data,
            MessageKind::FinalizeStage,
            request.encode(),
            self.opts.network_timeout,
        )
        .await
        .map(|_| ())
    }

    pub async fn health_check(&mut self) -> Result<()> {
        exchange(
            &mut self.data,
            MessageKind::HealthCheck,
            Bytes::new(),
            self.opts.network_timeout,
        )
        .await
        .map(|_| ())
    }
}
