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

//! In-memory registry for standalone deployments and tests.
//!
//! Leases are tracked against an `Instant` clock and swept lazily on every
//! access, so an owner that stops heartbeating disappears within one session
//! timeout just like it would under the real coordination service.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::cluster::WorkerDetail;
use crate::error::{Result, RssError};
use crate::registry::{
    LeaseId, Registry, RegistryEvent, RegistryEventStream, worker_key,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct WorkerEntry {
    detail: WorkerDetail,
    lease: LeaseId,
    expires_at: Instant,
}

#[derive(Debug, Clone)]
struct MasterEntry {
    name: String,
    lease: LeaseId,
    expires_at: Instant,
}

#[derive(Debug, Clone)]
enum LeaseTarget {
    Worker { key: String },
    Master { scope: String },
}

pub struct MemoryRegistry {
    session_timeout: Duration,
    next_lease: AtomicU64,
    /// worker registry key -> entry
    workers: DashMap<String, WorkerEntry>,
    /// "{dc}/{cluster}" -> active master
    masters: DashMap<String, MasterEntry>,
    leases: DashMap<LeaseId, LeaseTarget>,
    /// "{dc}/{cluster}" -> worker membership events
    worker_events: DashMap<String, broadcast::Sender<RegistryEvent>>,
    /// "{dc}/{cluster}" -> master change events
    master_events: DashMap<String, broadcast::Sender<RegistryEvent>>,
    active_cluster: Mutex<Option<(String, String)>>,
}

impl MemoryRegistry {
    pub fn new(session_timeout: Duration) -> Self {
        Self {
            session_timeout,
            next_lease: AtomicU64::new(1),
            workers: DashMap::new(),
            masters: DashMap::new(),
            leases: DashMap::new(),
            worker_events: DashMap::new(),
            master_events: DashMap::new(),
            active_cluster: Mutex::new(None),
        }
    }

    fn scope(data_center: &str, cluster: &str) -> String {
        format!("{data_center}/{cluster}")
    }

    fn grant_lease(&self, target: LeaseTarget) -> LeaseId {
        let lease = self.next_lease.fetch_add(1, Ordering::SeqCst);
        self.leases.insert(lease, target);
        lease
    }

    fn worker_sender(&self, scope: &str) -> broadcast::Sender<RegistryEvent> {
        self.worker_events
            .entry(scope.to_owned())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .clone()
    }

    fn master_sender(&self, scope: &str) -> broadcast::Sender<RegistryEvent> {
        self.master_events
            .entry(scope.to_owned())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Drops every entry whose lease has lapsed, emitting the same events a
    /// real session expiry would.
    fn sweep(&self) {
        let now = Instant::now();

        let expired: Vec<(String, WorkerEntry)> = self
            .workers
            .iter()
            .filter(|e| e.value().expires_at <= now)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (key, entry) in expired {
            self.workers.remove(&key);
            self.leases.remove(&entry.lease);
            let scope = Self::scope(&entry.detail.data_center, &entry.detail.cluster);
            let _ = self
                .worker_sender(&scope)
                .send(RegistryEvent::WorkerLeft(entry.detail.name()));
        }

        let lapsed: Vec<(String, MasterEntry)> = self
            .masters
            .iter()
            .filter(|e| e.value().expires_at <= now)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (scope, entry) in lapsed {
            self.masters.remove(&scope);
            self.leases.remove(&entry.lease);
            let _ = self
                .master_sender(&scope)
                .send(RegistryEvent::MasterChanged(None));
        }
    }

    fn event_stream(sender: broadcast::Sender<RegistryEvent>) -> RegistryEventStream {
        let stream = BroadcastStream::new(sender.subscribe())
            .filter_map(|item| futures::future::ready(item.ok()));
        Box::pin(stream)
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn register_worker(&self, detail: &WorkerDetail) -> Result<LeaseId> {
        self.sweep();
        let key = worker_key(&detail.data_center, &detail.cluster, &detail.name());
        let lease = self.grant_lease(LeaseTarget::Worker { key: key.clone() });
        self.workers.insert(
            key,
            WorkerEntry {
                detail: detail.clone(),
                lease,
                expires_at: Instant::now() + self.session_timeout,
            },
        );
        let scope = Self::scope(&detail.data_center, &detail.cluster);
        let _ = self
            .worker_sender(&scope)
            .send(RegistryEvent::WorkerJoined(detail.clone()));
        Ok(lease)
    }

    async fn heartbeat_worker(
        &self,
        lease: LeaseId,
        detail: &WorkerDetail,
    ) -> Result<()> {
        self.sweep();
        let key = worker_key(&detail.data_center, &detail.cluster, &detail.name());
        let mut entry = self.workers.get_mut(&key).ok_or_else(|| {
            RssError::Registry(format!(
                "worker {} lost its registry entry (session expired)",
                detail.name()
            ))
        })?;
        if entry.lease != lease {
            return Err(RssError::Registry(format!(
                "worker {} holds a stale lease",
                detail.name()
            )));
        }
        entry.detail = detail.clone();
        entry.expires_at = Instant::now() + self.session_timeout;
        Ok(())
    }

    async fn unregister_worker(&self, detail: &WorkerDetail) -> Result<()> {
        let key = worker_key(&detail.data_center, &detail.cluster, &detail.name());
        if let Some((_, entry)) = self.workers.remove(&key) {
            self.leases.remove(&entry.lease);
            let scope = Self::scope(&detail.data_center, &detail.cluster);
            let _ = self
                .worker_sender(&scope)
                .send(RegistryEvent::WorkerLeft(detail.name()));
        }
        Ok(())
    }

    async fn list_workers(
        &self,
        data_center: &str,
        cluster: &str,
    ) -> Result<Vec<WorkerDetail>> {
        self.sweep();
        Ok(self
            .workers
            .iter()
            .filter(|e| {
                e.value().detail.data_center == data_center
                    && e.value().detail.cluster == cluster
            })
            .map(|e| e.value().detail.clone())
            .collect())
    }

    async fn elect_master(
        &self,
        data_center: &str,
        cluster: &str,
        candidate: &str,
    ) -> Result<Option<LeaseId>> {
        self.sweep();
        let scope = Self::scope(data_center, cluster);
        if let Some(current) = self.masters.get(&scope) {
            if current.name == candidate {
                return Ok(Some(current.lease));
            }
            return Ok(None);
        }
        let lease = self.grant_lease(LeaseTarget::Master {
            scope: scope.clone(),
        });
        self.masters.insert(
            scope.clone(),
            MasterEntry {
                name: candidate.to_owned(),
                lease,
                expires_at: Instant::now() + self.session_timeout,
            },
        );
        let _ = self
            .master_sender(&scope)
            .send(RegistryEvent::MasterChanged(Some(candidate.to_owned())));
        Ok(Some(lease))
    }

    async fn renew_lease(&self, lease: LeaseId) -> Result<()> {
        let target = self
            .leases
            .get(&lease)
            .map(|t| t.value().clone())
            .ok_or_else(|| RssError::Registry(format!("lease {lease} has expired")))?;
        let expires_at = Instant::now() + self.session_timeout;
        match target {
            LeaseTarget::Worker { key } => {
                if let Some(mut entry) = self.workers.get_mut(&key) {
                    entry.expires_at = expires_at;
                }
            }
            LeaseTarget::Master { scope } => {
                if let Some(mut entry) = self.masters.get_mut(&scope) {
                    entry.expires_at = expires_at;
                }
            }
        }
        Ok(())
    }

    async fn release_lease(&self, lease: LeaseId) -> Result<()> {
        let Some((_, target)) = self.leases.remove(&lease) else {
            return Ok(());
        };
        match target {
            LeaseTarget::Worker { key } => {
                if let Some((_, entry)) = self.workers.remove(&key) {
                    let scope = Self::scope(
                        &entry.detail.data_center,
                        &entry.detail.cluster,
                    );
                    let _ = self
                        .worker_sender(&scope)
                        .send(RegistryEvent::WorkerLeft(entry.detail.name()));
                }
            }
            LeaseTarget::Master { scope } => {
                if self.masters.remove(&scope).is_some() {
                    let _ = self
                        .master_sender(&scope)
                        .send(RegistryEvent::MasterChanged(None));
                }
            }
        }
        Ok(())
    }

    async fn get_active_master(
        &self,
        data_center: &str,
        cluster: &str,
    ) -> Result<Option<String>> {
        self.sweep();
        Ok(self
            .masters
            .get(&Self::scope(data_center, cluster))
            .map(|e| e.name.clone()))
    }

    async fn watch_workers(
        &self,
        data_center: &str,
        cluster: &str,
    ) -> Result<RegistryEventStream> {
        let sender = self.worker_sender(&Self::scope(data_center, cluster));
        Ok(Self::event_stream(sender))
    }

    async fn watch_master(
        &self,
        data_center: &str,
        cluster: &str,
    ) -> Result<RegistryEventStream> {
        let sender = self.master_sender(&Self::scope(data_center, cluster));
        Ok(Self::event_stream(sender))
    }

    async fn get_active_cluster(&self) -> Result<Option<(String, String)>> {
        Ok(self.active_cluster.lock().clone())
    }

    async fn set_active_cluster(&self, data_center: &str, cluster: &str) -> Result<()> {
        *self.active_cluster.lock() = Some((data_center.to_owned(), cluster.to_owned()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detail(host: &str) -> WorkerDetail {
        WorkerDetail {
            host: host.to_owned(),
            data_port: 21000,
            control_port: 21001,
            weight: 1,
            data_center: "dc1".to_owned(),
            cluster: "default".to_owned(),
            last_heartbeat: 0,
        }
    }

    #[tokio::test]
    async fn membership_is_ephemeral() {
        let registry = MemoryRegistry::new(Duration::from_millis(50));
        let lease = registry.register_worker(&detail("a")).await.unwrap();
        assert_eq!(registry.list_workers("dc1", "default").await.unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(registry.list_workers("dc1", "default").await.unwrap().is_empty());
        assert!(registry.renew_lease(lease).await.is_err());
    }

    #[tokio::test]
    async fn heartbeat_extends_the_session() {
        let registry = MemoryRegistry::new(Duration::from_millis(80));
        let worker = detail("a");
        let lease = registry.register_worker(&worker).await.unwrap();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            registry.heartbeat_worker(lease, &worker).await.unwrap();
        }
        assert_eq!(registry.list_workers("dc1", "default").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn election_is_single_winner() {
        let registry = MemoryRegistry::new(Duration::from_secs(10));
        let won = registry
            .elect_master("dc1", "default", "m1:20000")
            .await
            .unwrap();
        assert!(won.is_some());
        // A contender loses while the holder is alive.
        assert!(registry
            .elect_master("dc1", "default", "m2:20000")
            .await
            .unwrap()
            .is_none());
        // Re-election by the holder is idempotent.
        assert!(registry
            .elect_master("dc1", "default", "m1:20000")
            .await
            .unwrap()
            .is_some());

        // The seat opens on release and a contender takes it.
        registry.release_lease(won.unwrap()).await.unwrap();
        assert!(registry
            .elect_master("dc1", "default", "m2:20000")
            .await
            .unwrap()
            .is_some());
        assert_eq!(
            registry.get_active_master("dc1", "default").await.unwrap(),
            Some("m2:20000".to_owned())
        );
    }

    #[tokio::test]
    async fn active_cluster_pointer_round_trips() {
        let registry = MemoryRegistry::new(Duration::from_secs(10));
        assert!(registry.get_active_cluster().await.unwrap().is_none());
        registry.set_active_cluster("dc1", "blue").await.unwrap();
        assert_eq!(
            registry.get_active_cluster().await.unwrap(),
            Some(("dc1".to_owned(), "blue".to_owned()))
        );
    }

    #[tokio::test]
    async fn watchers_observe_membership_changes() {
        let registry = MemoryRegistry::new(Duration::from_secs(10));
        let mut watch = registry.watch_workers("dc1", "default").await.unwrap();

        let worker = detail("a");
        registry.register_worker(&worker).await.unwrap();
        let event = watch.next().await.unwrap();
        assert_eq!(event, RegistryEvent::WorkerJoined(worker.clone()));

        registry.unregister_worker(&worker).await.unwrap();
        let event = watch.next().await.unwrap();
        assert_eq!(event, RegistryEvent::WorkerLeft(worker.name()));
    }
}
