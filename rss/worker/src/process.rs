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

//! rss Worker Process
//!
//! Wires storage, the network endpoints, registry membership, heartbeating
//! and the retention sweeper into one process, with graceful shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{info, warn};
use object_store::ObjectStore;
use uuid::Uuid;

use rss_core::RSS_VERSION;
use rss_core::cluster::{ClusterConf, WorkerDetail};
use rss_core::config::RssConfig;
use rss_core::error::Result;
use rss_core::registry::Registry;
use rss_core::util::timestamp_millis;

use crate::retention;
use crate::server::WorkerServer;
use crate::shutdown::ShutdownNotifier;
use crate::storage::ShuffleStorage;

/// Configuration for the worker process.
pub struct WorkerProcessConfig {
    /// Local IP address for binding the worker endpoints.
    pub bind_host: String,
    /// External hostname/IP advertised in the registry.
    pub external_host: Option<String>,
    /// Data endpoint port; 0 binds an ephemeral port.
    pub data_port: u16,
    /// Control endpoint port; 0 binds an ephemeral port.
    pub control_port: u16,
    /// Allocation load weight advertised in the registry.
    pub weight: u32,
    pub config: RssConfig,
}

impl WorkerProcessConfig {
    pub fn standalone(config: RssConfig) -> Self {
        Self {
            bind_host: "127.0.0.1".to_owned(),
            external_host: None,
            data_port: 0,
            control_port: 0,
            weight: 1,
            config,
        }
    }
}

/// How long [`WorkerHandle::stop`] waits for background tasks to drain.
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A running worker. Dropping the handle leaves the worker running; call
/// [`WorkerHandle::stop`] for a graceful shutdown.
pub struct WorkerHandle {
    pub detail: WorkerDetail,
    pub worker_id: String,
    storage: Arc<ShuffleStorage>,
    registry: Arc<dyn Registry>,
    lease: Arc<AtomicU64>,
    notifier: ShutdownNotifier,
}

impl WorkerHandle {
    /// Stops the background tasks first (so the heartbeater cannot
    /// re-register mid-teardown), then deregisters and releases the lease.
    pub async fn stop(self) {
        info!("Worker {} shutting down", self.worker_id);
        self.notifier.shutdown(STOP_DRAIN_TIMEOUT).await;
        if let Err(e) = self.registry.unregister_worker(&self.detail).await {
            warn!("Deregistration failed: {e}");
        }
        let _ = self
            .registry
            .release_lease(self.lease.load(Ordering::Acquire))
            .await;
        self.storage.stop();
    }
}

/// Starts a worker against the given registry and DFS.
///
/// The registry and object store are injected so the same startup path
/// serves the daemon binary (etcd + a real DFS) and the in-process
/// standalone mode used by tests.
pub async fn start_worker_process(
    opt: WorkerProcessConfig,
    registry: Arc<dyn Registry>,
    store: Arc<dyn ObjectStore>,
) -> Result<WorkerHandle> {
    let config = &opt.config;

    let mut worker_id = Uuid::new_v4().simple().to_string();
    worker_id.truncate(12);
    info!("Worker starting ... (rss {RSS_VERSION})");
    info!("Worker id: {worker_id}");

    let cluster_conf = ClusterConf {
        root_dir: config.storage_root(),
        data_center: config.data_center(),
        cluster: config.cluster(),
        dfs_site: config.dfs_site(),
    };

    let storage = ShuffleStorage::start(
        worker_id.clone(),
        cluster_conf.clone(),
        config,
        store.clone(),
    )?;
    let server = WorkerServer::new(
        storage.clone(),
        config.base_connections(),
        config.total_connections(),
        config.max_request_size(),
    );

    let mut notifier = ShutdownNotifier::new();

    let (data_addr, _data_task) = server
        .clone()
        .serve_data(
            &format!("{}:{}", opt.bind_host, opt.data_port),
            notifier.subscribe("data-server"),
        )
        .await?;
    let (control_addr, _control_task) = server
        .clone()
        .serve_control(
            &format!("{}:{}", opt.bind_host, opt.control_port),
            notifier.subscribe("control-server"),
        )
        .await?;

    let detail = WorkerDetail {
        host: opt.external_host.unwrap_or_else(|| opt.bind_host.clone()),
        data_port: data_addr.port(),
        control_port: control_addr.port(),
        weight: opt.weight.max(1),
        data_center: cluster_conf.data_center.clone(),
        cluster: cluster_conf.cluster.clone(),
        last_heartbeat: timestamp_millis(),
    };

    let lease = Arc::new(AtomicU64::new(
        registry.register_worker(&detail).await?,
    ));
    info!("Worker {} registered as {}", worker_id, detail.name());

    // Heartbeat loop: refresh the lease and republish load. A lost session
    // re-registers, so a registry hiccup costs at most one session timeout.
    {
        let registry = registry.clone();
        let lease = lease.clone();
        let mut detail = detail.clone();
        let mut shutdown = notifier.subscribe("heartbeater");
        let guard = notifier.drain_guard("heartbeater");
        let interval = Duration::from_millis(config.heartbeat_interval_millis());
        tokio::spawn(async move {
            let _guard = guard;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        detail.last_heartbeat = timestamp_millis();
                        let current = lease.load(Ordering::Acquire);
                        if let Err(e) = registry.heartbeat_worker(current, &detail).await {
                            warn!("Heartbeat failed ({e}); re-registering");
                            match registry.register_worker(&detail).await {
                                Ok(fresh) => lease.store(fresh, Ordering::Release),
                                Err(e) => warn!("Re-registration failed: {e}"),
                            }
                        }
                    }
                }
            }
        });
    }

    // Retention sweeper for DFS trees and in-memory stage state.
    {
        let sweep_interval = Duration::from_millis(
            (config.app_obj_retention_millis() / 4).clamp(1_000, 300_000),
        );
        retention::start_sweeper(
            store,
            cluster_conf,
            storage.clone(),
            Duration::from_millis(config.app_storage_retention_millis()),
            sweep_interval,
            notifier.subscribe("retention-sweeper"),
        );
    }

    Ok(WorkerHandle {
        detail,
        worker_id,
        storage,
        registry,
        lease,
        notifier,
    })
}
