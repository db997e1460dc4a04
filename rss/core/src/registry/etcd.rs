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

//! Etcd registry backend.
//!
//! Worker entries and the master pointer are bound to etcd leases with a TTL
//! of one session timeout; heartbeats keep the lease alive. Election is a
//! create-if-absent transaction on the master key.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, EventType, GetOptions, PutOptions, Txn, TxnOp,
    WatchOptions, WatchStream, Watcher,
};
use futures::Stream;
use log::{debug, warn};

use crate::cluster::WorkerDetail;
use crate::error::{Result, RssError};
use crate::registry::{
    LeaseId, Registry, RegistryEvent, RegistryEventStream, USE_CLUSTER_KEY, master_key,
    worker_key, workers_prefix,
};

pub struct EtcdRegistry {
    etcd: Client,
    session_timeout_secs: i64,
}

impl EtcdRegistry {
    pub async fn connect(
        endpoints: Vec<String>,
        session_timeout_secs: i64,
    ) -> Result<Self> {
        let etcd = Client::connect(endpoints.clone(), None).await.map_err(|e| {
            RssError::Registry(format!(
                "cannot connect to etcd at {endpoints:?}: {e}"
            ))
        })?;
        Ok(Self {
            etcd,
            session_timeout_secs: session_timeout_secs.max(1),
        })
    }

    pub fn new(etcd: Client, session_timeout_secs: i64) -> Self {
        Self {
            etcd,
            session_timeout_secs: session_timeout_secs.max(1),
        }
    }

    async fn grant_lease(&self) -> Result<i64> {
        let mut etcd = self.etcd.clone();
        let lease = etcd
            .lease_grant(self.session_timeout_secs, None)
            .await?
            .id();
        Ok(lease)
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn register_worker(&self, detail: &WorkerDetail) -> Result<LeaseId> {
        let lease = self.grant_lease().await?;
        let key = worker_key(&detail.data_center, &detail.cluster, &detail.name());
        let value = serde_json::to_vec(detail)?;
        let mut etcd = self.etcd.clone();
        etcd.put(key, value, Some(PutOptions::new().with_lease(lease)))
            .await?;
        Ok(lease as LeaseId)
    }

    async fn heartbeat_worker(
        &self,
        lease: LeaseId,
        detail: &WorkerDetail,
    ) -> Result<()> {
        self.renew_lease(lease).await?;
        let key = worker_key(&detail.data_center, &detail.cluster, &detail.name());
        let value = serde_json::to_vec(detail)?;
        let mut etcd = self.etcd.clone();
        etcd.put(key, value, Some(PutOptions::new().with_lease(lease as i64)))
            .await?;
        Ok(())
    }

    async fn unregister_worker(&self, detail: &WorkerDetail) -> Result<()> {
        let key = worker_key(&detail.data_center, &detail.cluster, &detail.name());
        let mut etcd = self.etcd.clone();
        etcd.delete(key, None).await?;
        Ok(())
    }

    async fn list_workers(
        &self,
        data_center: &str,
        cluster: &str,
    ) -> Result<Vec<WorkerDetail>> {
        let prefix = workers_prefix(data_center, cluster);
        let mut etcd = self.etcd.clone();
        let response = etcd
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        let mut workers = Vec::with_capacity(response.kvs().len());
        for kv in response.kvs() {
            match serde_json::from_slice::<WorkerDetail>(kv.value()) {
                Ok(detail) => workers.push(detail),
                Err(e) => {
                    warn!(
                        "Skipping unparseable worker entry {:?}: {e}",
                        kv.key_str().unwrap_or("<non-utf8>")
                    );
                }
            }
        }
        Ok(workers)
    }

    async fn elect_master(
        &self,
        data_center: &str,
        cluster: &str,
        candidate: &str,
    ) -> Result<Option<LeaseId>> {
        let key = master_key(data_center, cluster);
        let lease = self.grant_lease().await?;
        let mut etcd = self.etcd.clone();
        let txn = Txn::new()
            .when([Compare::create_revision(
                key.clone(),
                CompareOp::Equal,
                0,
            )])
            .and_then([TxnOp::put(
                key.clone(),
                candidate,
                Some(PutOptions::new().with_lease(lease)),
            )]);
        let response = etcd.txn(txn).await?;
        if response.succeeded() {
            debug!("Won master election for {data_center}/{cluster} as {candidate}");
            return Ok(Some(lease as LeaseId));
        }
        // Lost the race; give the unused lease back and report the loss.
        let _ = etcd.lease_revoke(lease).await;
        Ok(None)
    }

    async fn renew_lease(&self, lease: LeaseId) -> Result<()> {
        let mut etcd = self.etcd.clone();
        let (mut keeper, mut responses) = etcd.lease_keep_alive(lease as i64).await?;
        keeper.keep_alive().await?;
        if let Some(response) = responses.message().await? {
            if response.ttl() <= 0 {
                return Err(RssError::Registry(format!(
                    "lease {lease} has expired"
                )));
            }
        }
        Ok(())
    }

    async fn release_lease(&self, lease: LeaseId) -> Result<()> {
        let mut etcd = self.etcd.clone();
        etcd.lease_revoke(lease as i64).await?;
        Ok(())
    }

    async fn get_active_master(
        &self,
        data_center: &str,
        cluster: &str,
    ) -> Result<Option<String>> {
        let mut etcd = self.etcd.clone();
        let response = etcd.get(master_key(data_center, cluster), None).await?;
        Ok(response
            .kvs()
            .first()
            .and_then(|kv| kv.value_str().ok())
            .map(ToOwned::to_owned))
    }

    async fn watch_workers(
        &self,
        data_center: &str,
        cluster: &str,
    ) -> Result<RegistryEventStream> {
        let prefix = workers_prefix(data_center, cluster);
        let mut etcd = self.etcd.clone();
        let (watcher, stream) = etcd
            .watch(prefix.clone(), Some(WatchOptions::new().with_prefix()))
            .await?;
        Ok(Box::pin(EtcdEventStream {
            _watcher: watcher,
            stream,
            buffered: Vec::new(),
            mapper: EventMapper::Workers { prefix },
        }))
    }

    async fn watch_master(
        &self,
        data_center: &str,
        cluster: &str,
    ) -> Result<RegistryEventStream> {
        let key = master_key(data_center, cluster);
        let mut etcd = self.etcd.clone();
        let (watcher, stream) = etcd.watch(key, None).await?;
        Ok(Box::pin(EtcdEventStream {
            _watcher: watcher,
            stream,
            buffered: Vec::new(),
            mapper: EventMapper::Master,
        }))
    }

    async fn get_active_cluster(&self) -> Result<Option<(String, String)>> {
        let mut etcd = self.etcd.clone();
        let response = etcd.get(USE_CLUSTER_KEY, None).await?;
        Ok(response
            .kvs()
            .first()
            .and_then(|kv| kv.value_str().ok())
            .and_then(|v| {
                v.split_once('/')
                    .map(|(dc, c)| (dc.to_owned(), c.to_owned()))
            }))
    }

    async fn set_active_cluster(&self, data_center: &str, cluster: &str) -> Result<()> {
        let mut etcd = self.etcd.clone();
        etcd.put(
            USE_CLUSTER_KEY,
            format!("{data_center}/{cluster}"),
            None,
        )
        .await?;
        Ok(())
    }
}

enum EventMapper {
    Workers { prefix: String },
    Master,
}

impl EventMapper {
    fn map(&self, event: &etcd_client::Event) -> Option<RegistryEvent> {
        let kv = event.kv()?;
        match (self, event.event_type()) {
            (EventMapper::Workers { .. }, EventType::Put) => {
                match serde_json::from_slice::<WorkerDetail>(kv.value()) {
                    Ok(detail) => Some(RegistryEvent::WorkerJoined(detail)),
                    Err(e) => {
                        warn!("Ignoring unparseable worker update: {e}");
                        None
                    }
                }
            }
            (EventMapper::Workers { prefix }, EventType::Delete) => {
                let key = kv.key_str().ok()?;
                let name = key.strip_prefix(prefix.as_str())?;
                Some(RegistryEvent::WorkerLeft(name.to_owned()))
            }
            (EventMapper::Master, EventType::Put) => {
                let name = kv.value_str().ok()?;
                Some(RegistryEvent::MasterChanged(Some(name.to_owned())))
            }
            (EventMapper::Master, EventType::Delete) => {
                Some(RegistryEvent::MasterChanged(None))
            }
        }
    }
}

/// Adapts an etcd watch stream into registry events. The watcher handle is
/// held so the server-side watch stays open as long as the stream lives.
struct EtcdEventStream {
    _watcher: Watcher,
    stream: WatchStream,
    buffered: Vec<RegistryEvent>,
    mapper: EventMapper,
}

impl Stream for EtcdEventStream {
    type Item = RegistryEvent;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(event) = self.buffered.pop() {
                return Poll::Ready(Some(event));
            }
            match Pin::new(&mut self.stream).poll_next(cx) {
                Poll::Ready(Some(Ok(response))) => {
                    let mut mapped: Vec<RegistryEvent> = response
                        .events()
                        .iter()
                        .filter_map(|e| self.mapper.map(e))
                        .collect();
                    // Pop from the back; keep arrival order.
                    mapped.reverse();
                    self.buffered = mapped;
                }
                Poll::Ready(Some(Err(e))) => {
                    warn!("Etcd watch failed: {e}");
                    return Poll::Ready(None);
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
