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

//! The worker's network endpoints.
//!
//! The *control* endpoint issues flow-control tokens (`OpenConnection`) and
//! answers health probes. The *data* endpoint accepts `SendBlock`,
//! `FinalizeStage` and `HealthCheck` after a handshake that presents a
//! control token; dropping the data connection returns the token to the
//! pool. Requests past their deadline are dropped with a typed error on
//! both endpoints.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use uuid::Uuid;

use rss_core::error::{Result, RssError};
use rss_core::protocol::codec::FramedStream;
use rss_core::protocol::{
    DataHandshake, FinalizeStageRequest, MessageKind, Reply, Request, SendBlockReply,
    SendBlockRequest, encode_token,
};
use rss_core::util::timestamp_millis;

use crate::shutdown::Shutdown;
use crate::storage::ShuffleStorage;
use crate::token::{ConnectionToken, ConnectionTokens};

pub struct WorkerServer {
    storage: Arc<ShuffleStorage>,
    tokens: ConnectionTokens,
    issued: DashMap<Uuid, ConnectionToken>,
    max_request_size: usize,
}

impl WorkerServer {
    pub fn new(
        storage: Arc<ShuffleStorage>,
        base_connections: usize,
        total_connections: usize,
        max_request_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            tokens: ConnectionTokens::new(base_connections, total_connections),
            issued: DashMap::new(),
            max_request_size,
        })
    }

    /// Binds the control endpoint and serves it until shutdown.
    pub async fn serve_control(
        self: Arc<Self>,
        addr: &str,
        mut shutdown: Shutdown,
    ) -> Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr).await.map_err(RssError::IoError)?;
        let local = listener.local_addr().map_err(RssError::IoError)?;
        info!("Worker control endpoint listening on {local}");
        let server = self;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!("Control connection from {peer}");
                            let server = server.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_control(stream).await {
                                    warn!("Control connection from {peer} failed: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            error!("Control accept failed: {e}");
                            break;
                        }
                    }
                }
            }
        });
        Ok((local, handle))
    }

    /// Binds the data endpoint and serves it until shutdown.
    pub async fn serve_data(
        self: Arc<Self>,
        addr: &str,
        mut shutdown: Shutdown,
    ) -> Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr).await.map_err(RssError::IoError)?;
        let local = listener.local_addr().map_err(RssError::IoError)?;
        info!("Worker data endpoint listening on {local}");
        let server = self;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!("Data connection from {peer}");
                            let server = server.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_data(stream).await {
                                    warn!("Data connection from {peer} failed: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            error!("Data accept failed: {e}");
                            break;
                        }
                    }
                }
            }
        });
        Ok((local, handle))
    }

    async fn handle_control(&self, stream: TcpStream) -> Result<()> {
        let mut framed = FramedStream::new(stream, self.max_request_size);
        while let Some(request) = framed.read_request().await? {
            let reply = match self.check_deadline(&request) {
                Err(e) => Reply::failure(request.kind, request.request_id, &e),
                Ok(()) => match request.kind {
                    MessageKind::OpenConnection => self.open_connection(&request).await,
                    MessageKind::HealthCheck => {
                        Reply::ok(request.kind, request.request_id, Bytes::new())
                    }
                    other => Reply::failure(
                        request.kind,
                        request.request_id,
                        &RssError::Protocol(format!(
                            "{other:?} is not a control-channel request"
                        )),
                    ),
                },
            };
            framed.write_reply(&reply).await?;
        }
        Ok(())
    }

    async fn handle_data(&self, stream: TcpStream) -> Result<()> {
        let mut framed = FramedStream::new(stream, self.max_request_size);

        // The handshake must come first and present a live token.
        let Some(first) = framed.read_request().await? else {
            return Ok(());
        };
        let token = match self.accept_handshake(&first) {
            Ok(token) => {
                framed
                    .write_reply(&Reply::ok(first.kind, first.request_id, Bytes::new()))
                    .await?;
                token
            }
            Err(e) => {
                framed
                    .write_reply(&Reply::failure(first.kind, first.request_id, &e))
                    .await?;
                return Err(e);
            }
        };

        let result = self.serve_data_requests(&mut framed).await;

        // Connection gone; the token returns to the pool.
        if self.issued.remove(&token).is_some() {
            debug!("Returned connection token {token}");
        }
        result
    }

    async fn serve_data_requests(
        &self,
        framed: &mut FramedStream<TcpStream>,
    ) -> Result<()> {
        while let Some(request) = framed.read_request().await? {
            let reply = match self.check_deadline(&request) {
                Err(e) => Reply::failure(request.kind, request.request_id, &e),
                Ok(()) => match request.kind {
                    MessageKind::SendBlock => self.send_block(&request).await,
                    MessageKind::FinalizeStage => self.finalize_stage(&request).await,
                    MessageKind::HealthCheck => {
                        Reply::ok(request.kind, request.request_id, Bytes::new())
                    }
                    other => Reply::failure(
                        request.kind,
                        request.request_id,
                        &RssError::Protocol(format!(
                            "{other:?} is not a data-channel request"
                        )),
                    ),
                },
            };
            framed.write_reply(&reply).await?;
        }
        Ok(())
    }

    fn check_deadline(&self, request: &Request) -> Result<()> {
        if request.expired(timestamp_millis()) {
            Err(RssError::Expired(format!(
                "request {} arrived past its deadline",
                request.request_id
            )))
        } else {
            Ok(())
        }
    }

    async fn open_connection(&self, request: &Request) -> Reply {
        // Body is informational (app identity); validate it parses.
        if let Err(e) =
            rss_core::protocol::OpenConnectionRequest::decode(request.body.clone())
        {
            return Reply::failure(request.kind, request.request_id, &e);
        }
        let wait = Duration::from_millis(
            request.deadline_ms.saturating_sub(timestamp_millis()),
        );
        match self.tokens.acquire(wait).await {
            Ok(token) => {
                let id = Uuid::new_v4();
                self.issued.insert(id, token);
                Reply::ok(request.kind, request.request_id, encode_token(id))
            }
            Err(e) => Reply::failure(request.kind, request.request_id, &e),
        }
    }

    fn accept_handshake(&self, request: &Request) -> Result<Uuid> {
        if request.kind != MessageKind::DataHandshake {
            return Err(RssError::Protocol(format!(
                "data channel must open with a handshake, got {:?}",
                request.kind
            )));
        }
        let handshake = DataHandshake::decode(request.body.clone())?;
        if !self.issued.contains_key(&handshake.token) {
            return Err(RssError::Protocol(format!(
                "unknown connection token {}",
                handshake.token
            )));
        }
        Ok(handshake.token)
    }

    async fn send_block(&self, request: &Request) -> Reply {
        let parsed = match SendBlockRequest::decode(request.body.clone()) {
            Ok(parsed) => parsed,
            Err(e) => return Reply::failure(request.kind, request.request_id, &e),
        };
        match self.storage.append_block(&parsed).await {
            Ok(duplicate) => Reply::ok(
                request.kind,
                request.request_id,
                SendBlockReply { duplicate }.encode(),
            ),
            Err(e) => Reply::failure(request.kind, request.request_id, &e),
        }
    }

    async fn finalize_stage(&self, request: &Request) -> Reply {
        let parsed = match FinalizeStageRequest::decode(request.body.clone()) {
            Ok(parsed) => parsed,
            Err(e) => return Reply::failure(request.kind, request.request_id, &e),
        };
        info!("Finalizing {} on this worker", parsed.stage);
        match self.storage.finalize_stage(&parsed.stage).await {
            Ok(()) => Reply::ok(request.kind, request.request_id, Bytes::new()),
            Err(e) => Reply::failure(request.kind, request.request_id, &e),
        }
    }
}
