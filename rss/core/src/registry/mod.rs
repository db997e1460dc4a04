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

//! Thin wrapper over the coordination service.
//!
//! Membership is ephemeral: worker entries and the master pointer are bound
//! to leases, and losing liveness removes them within one session timeout.
//! Master election is single-winner. Reads of the small pointers (active
//! master, active cluster) are linearizable; worker list views are
//! eventually consistent.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::cluster::WorkerDetail;
use crate::error::Result;

mod etcd;
mod memory;

pub use etcd::EtcdRegistry;
pub use memory::MemoryRegistry;

/// Changes observed by registry watchers.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    WorkerJoined(WorkerDetail),
    /// Carries the registry name (`host:data_port`) of the departed worker.
    WorkerLeft(String),
    MasterChanged(Option<String>),
}

pub type RegistryEventStream = Pin<Box<dyn Stream<Item = RegistryEvent> + Send>>;

/// Lease handle for ephemeral registry state.
pub type LeaseId = u64;

/// `/rss/{dc}/{cluster}/workers/{name}`
pub fn worker_key(data_center: &str, cluster: &str, name: &str) -> String {
    format!("/rss/{data_center}/{cluster}/workers/{name}")
}

/// `/rss/{dc}/{cluster}/workers/`
pub fn workers_prefix(data_center: &str, cluster: &str) -> String {
    format!("/rss/{data_center}/{cluster}/workers/")
}

/// `/rss/{dc}/{cluster}/master`
pub fn master_key(data_center: &str, cluster: &str) -> String {
    format!("/rss/{data_center}/{cluster}/master")
}

/// `/rss/use_cluster`
pub const USE_CLUSTER_KEY: &str = "/rss/use_cluster";

#[async_trait]
pub trait Registry: Send + Sync + 'static {
    /// Publishes an ephemeral worker entry; returns its lease.
    async fn register_worker(&self, detail: &WorkerDetail) -> Result<LeaseId>;

    /// Refreshes a worker's lease and republishes its (weight, heartbeat)
    /// fields.
    async fn heartbeat_worker(&self, lease: LeaseId, detail: &WorkerDetail)
        -> Result<()>;

    /// Removes a worker entry eagerly, ahead of lease expiry.
    async fn unregister_worker(&self, detail: &WorkerDetail) -> Result<()>;

    /// Lists the live workers of one datacenter + cluster.
    async fn list_workers(
        &self,
        data_center: &str,
        cluster: &str,
    ) -> Result<Vec<WorkerDetail>>;

    /// Attempts to become the active master. Returns the master lease when
    /// the candidate wins (or already holds the seat), `None` when another
    /// contender holds it.
    async fn elect_master(
        &self,
        data_center: &str,
        cluster: &str,
        candidate: &str,
    ) -> Result<Option<LeaseId>>;

    /// Refreshes any lease issued by this registry.
    async fn renew_lease(&self, lease: LeaseId) -> Result<()>;

    /// Drops a lease and the ephemeral state bound to it.
    async fn release_lease(&self, lease: LeaseId) -> Result<()>;

    /// Linearizable read of the active master pointer (`host:control_port`).
    async fn get_active_master(
        &self,
        data_center: &str,
        cluster: &str,
    ) -> Result<Option<String>>;

    /// Watches worker membership of one datacenter + cluster.
    async fn watch_workers(
        &self,
        data_center: &str,
        cluster: &str,
    ) -> Result<RegistryEventStream>;

    /// Watches the active master pointer.
    async fn watch_master(
        &self,
        data_center: &str,
        cluster: &str,
    ) -> Result<RegistryEventStream>;

    /// Linearizable read of the active-cluster pointer, `(dc, cluster)`.
    async fn get_active_cluster(&self) -> Result<Option<(String, String)>>;

    /// Repoints `/rss/use_cluster`.
    async fn set_active_cluster(&self, data_center: &str, cluster: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_paths() {
        assert_eq!(
            worker_key("dc1", "default", "10.0.0.1:21000"),
            "/rss/dc1/default/workers/10.0.0.1:21000"
        );
        assert_eq!(master_key("dc1", "default"), "/rss/dc1/default/master");
        assert!(worker_key("dc1", "default", "x").starts_with(&workers_prefix("dc1", "default")));
    }
}
