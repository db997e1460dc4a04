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

//! The master's control endpoint: answers `GetShuffleWorkers` while this
//! process holds the leader seat, plus health probes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use rss_core::error::{Result, RssError};
use rss_core::protocol::codec::FramedStream;
use rss_core::protocol::{GetShuffleWorkersRequest, MessageKind, Reply, Request};
use rss_core::util::timestamp_millis;

use crate::allocator::Allocator;

pub struct MasterServer {
    allocator: Allocator,
    is_leader: AtomicBool,
    max_request_size: usize,
}

impl MasterServer {
    pub fn new(allocator: Allocator, max_request_size: usize) -> Arc<Self> {
        Arc::new(Self {
            allocator,
            is_leader: AtomicBool::new(false),
            max_request_size,
        })
    }

    pub fn set_leader(&self, leader: bool) {
        self.is_leader.store(leader, Ordering::Release);
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    pub async fn serve(
        self: Arc<Self>,
        addr: &str,
        mut shutdown: crate::process::ShutdownSignal,
    ) -> Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr).await.map_err(RssError::IoError)?;
        let local = listener.local_addr().map_err(RssError::IoError)?;
        info!("Master control endpoint listening on {local}");
        let server = self;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!("Master connection from {peer}");
                            let server = server.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    warn!("Master connection from {peer} failed: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            error!("Master accept failed: {e}");
                            break;
                        }
                    }
                }
            }
        });
        Ok((local, handle))
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let mut framed = FramedStream::new(stream, self.max_request_size);
        while let Some(request) = framed.read_request().await? {
            let reply = self.dispatch(&request);
            framed.write_reply(&reply).await?;
        }
        Ok(())
    }

    fn dispatch(&self, request: &Request) -> Reply {
        if request.expired(timestamp_millis()) {
            return Reply::failure(
                request.kind,
                request.request_id,
                &RssError::Expired(format!(
                    "request {} arrived past its deadline",
                    request.request_id
                )),
            );
        }
        match request.kind {
            MessageKind::HealthCheck => {
                Reply::ok(request.kind, request.request_id, Bytes::new())
            }
            MessageKind::GetShuffleWorkers => self.get_shuffle_workers(request),
            other => Reply::failure(
                request.kind,
                request.request_id,
                &RssError::Protocol(format!("{other:?} is not a master request")),
            ),
        }
    }

    fn get_shuffle_workers(&self, request: &Request) -> Reply {
        if !self.is_leader() {
            // The client re-resolves the leader through the registry.
            return Reply::failure(
                request.kind,
                request.request_id,
                &RssError::Connection(
                    "this master is not the active leader".to_owned(),
                ),
            );
        }
        let parsed = match GetShuffleWorkersRequest::decode(request.body.clone()) {
            Ok(parsed) => parsed,
            Err(e) => return Reply::failure(request.kind, request.request_id, &e),
        };
        match self
            .allocator
            .get_shuffle_workers(&parsed)
            .and_then(|reply| reply.encode())
        {
            Ok(body) => Reply::ok(request.kind, request.request_id, body),
            Err(e) => Reply::failure(request.kind, request.request_id, &e),
        }
    }
}
