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

//! The per-driver service manager: allocation source, handle construction
//! and the factory surface for writers, readers and finalizers.
//!
//! `service.manager.type` selects where allocations come from: `master`
//! asks the elected master over RPC (re-resolving the leader through the
//! registry when the seat moves), `zk` lists workers straight from the
//! registry and samples client-side with the same weighted algorithm the
//! master uses. One manager exists per driver, with explicit init and
//! close; it never leaks across application lifetimes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use log::{info, warn};
use object_store::ObjectStore;
use tokio::sync::Mutex;

use rss_core::cluster::weighted_sample;
use rss_core::config::RssConfig;
use rss_core::error::{Result, RssError};
use rss_core::handle::ShuffleHandle;
use rss_core::ids::StageShuffleId;
use rss_core::protocol::{GetShuffleWorkersReply, GetShuffleWorkersRequest};
use rss_core::registry::Registry;

use crate::connection::{ConnectOptions, MasterClient};
use crate::finalizer::StageFinalizer;
use crate::reader::ShuffleReader;
use crate::writer::{ShuffleDependency, ShuffleWriter};
use crate::ShuffleService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceManagerKind {
    /// Allocate through the elected master.
    Master,
    /// Allocate client-side from the registry worker list.
    Zk,
}

impl ServiceManagerKind {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "master" => Ok(ServiceManagerKind::Master),
            "zk" => Ok(ServiceManagerKind::Zk),
            other => Err(RssError::Configuration(format!(
                "unknown service manager type '{other}'"
            ))),
        }
    }
}

pub struct ShuffleServiceManager {
    config: RssConfig,
    kind: ServiceManagerKind,
    registry: Arc<dyn Registry>,
    store: Arc<dyn ObjectStore>,
    opts: ConnectOptions,
    cached_master: Mutex<Option<String>>,
    /// Resolved (datacenter, cluster), honoring `/rss/use_cluster`.
    scope: Mutex<Option<(String, String)>>,
    closed: AtomicBool,
}

impl ShuffleServiceManager {
    /// Initializes the driver-wide manager.
    pub fn init(
        config: RssConfig,
        registry: Arc<dyn Registry>,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Arc<Self>> {
        let kind = ServiceManagerKind::parse(&config.service_manager_type())?;
        info!("Shuffle service manager initialized in {kind:?} mode");
        Ok(Arc::new(Self {
            opts: ConnectOptions::from_config(&config),
            config,
            kind,
            registry,
            store,
            cached_master: Mutex::new(None),
            scope: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    /// The datacenter/cluster this driver allocates from: the registry's
    /// active-cluster pointer when present, the local configuration
    /// otherwise. Resolved once per driver.
    async fn resolve_scope(&self) -> Result<(String, String)> {
        let mut scope = self.scope.lock().await;
        if let Some(resolved) = scope.clone() {
            return Ok(resolved);
        }
        let resolved = match self.registry.get_active_cluster().await {
            Ok(Some(pointed)) => {
                info!(
                    "Following the active-cluster pointer to {}/{}",
                    pointed.0, pointed.1
                );
                pointed
            }
            Ok(None) => (self.config.data_center(), self.config.cluster()),
            Err(e) => {
                warn!("Active-cluster lookup failed ({e}); using local config");
                (self.config.data_center(), self.config.cluster())
            }
        };
        *scope = Some(resolved.clone());
        Ok(resolved)
    }

    /// Marks the manager closed; further registrations fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn config(&self) -> &RssConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RssError::Internal(
                "shuffle service manager is closed".to_owned(),
            ));
        }
        Ok(())
    }

    async fn resolve_master(&self, invalidate: bool) -> Result<String> {
        let (data_center, cluster) = self.resolve_scope().await?;
        let mut cached = self.cached_master.lock().await;
        if invalidate {
            *cached = None;
        }
        if let Some(addr) = cached.clone() {
            return Ok(addr);
        }
        let addr = self
            .registry
            .get_active_master(&data_center, &cluster)
            .await?
            .ok_or_else(|| {
                RssError::Registry(format!(
                    "no active master for {data_center}/{cluster}"
                ))
            })?;
        *cached = Some(addr.clone());
        Ok(addr)
    }

    async fn master_allocate(
        &self,
        request: &GetShuffleWorkersRequest,
    ) -> Result<GetShuffleWorkersReply> {
        let mut invalidate = false;
        let mut last_error: Option<RssError> = None;
        for _ in 0..=self.opts.network_retries {
            let addr = self.resolve_master(invalidate).await?;
            let attempt = async {
                let mut client = MasterClient::connect(&addr, &self.opts).await?;
                client.get_shuffle_workers(request).await
            }
            .await;
            match attempt {
                Ok(reply) => return Ok(reply),
                // Allocation errors are final; redirect-style failures
                // (connection refused, demoted leader) re-read the registry.
                Err(e @ RssError::NoShuffleWorkers(_)) => return Err(e),
                Err(e) => {
                    warn!("Allocation via master {addr} failed: {e}; re-resolving");
                    invalidate = true;
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            RssError::Internal("master allocation retries exhausted".to_owned())
        }))
    }

    async fn registry_allocate(
        &self,
        request: &GetShuffleWorkersRequest,
    ) -> Result<GetShuffleWorkersReply> {
        let live = self
            .registry
            .list_workers(&request.data_center, &request.cluster)
            .await?;
        if live.is_empty() {
            return Err(RssError::NoShuffleWorkers(format!(
                "no live workers in {}/{} for app {}",
                request.data_center, request.cluster, request.app_id
            )));
        }
        let desired = request
            .requested_count
            .clamp(
                self.config.min_server_count().max(1),
                self.config.max_server_count().max(1),
            )
            .min(live.len());
        let workers = weighted_sample(&live, desired, &mut rand::thread_rng());
        Ok(GetShuffleWorkersReply {
            workers,
            cluster_conf: rss_core::cluster::ClusterConf {
                root_dir: self.config.storage_root(),
                data_center: request.data_center.clone(),
                cluster: request.cluster.clone(),
                dfs_site: self.config.dfs_site(),
            },
        })
    }

    pub fn finalizer(&self, handle: Arc<ShuffleHandle>) -> StageFinalizer {
        StageFinalizer::new(handle, self.store.clone(), &self.config)
    }
}

#[async_trait]
impl ShuffleService for ShuffleServiceManager {
    async fn register_shuffle(
        &self,
        stage: StageShuffleId,
        num_partitions: u32,
    ) -> Result<ShuffleHandle> {
        self.ensure_open()?;
        let (data_center, cluster) = self.resolve_scope().await?;
        let per_worker = self.config.partition_count_per_shuffle_worker().max(1);
        let requested_count = (num_partitions as usize).div_ceil(per_worker).max(1);
        let request = GetShuffleWorkersRequest {
            data_center,
            cluster,
            app_id: stage.app_id.clone(),
            dag_id: format!("shuffle-{}", stage.shuffle_id),
            priority: 0,
            task_id: String::new(),
            app_name: stage.app_id.clone(),
            requested_count,
        };
        let reply = match self.kind {
            ServiceManagerKind::Master => self.master_allocate(&request).await?,
            ServiceManagerKind::Zk => self.registry_allocate(&request).await?,
        };
        info!(
            "Registered {} over {} workers ({} partitions)",
            stage,
            reply.workers.len(),
            num_partitions
        );
        ShuffleHandle::build(
            stage,
            num_partitions,
            reply.workers,
            self.config.workers_per_group(),
            reply.cluster_conf,
        )
    }

    fn get_writer(
        &self,
        handle: &ShuffleHandle,
        map_id: u32,
        map_attempt: u16,
        dependency: &ShuffleDependency,
    ) -> Result<ShuffleWriter> {
        self.ensure_open()?;
        ShuffleWriter::open(
            Arc::new(handle.clone()),
            map_id,
            map_attempt,
            dependency,
            &self.config,
        )
    }

    fn get_reader(&self, handle: &ShuffleHandle) -> Result<ShuffleReader> {
        self.ensure_open()?;
        Ok(ShuffleReader::new(
            Arc::new(handle.clone()),
            self.store.clone(),
            &self.config,
        ))
    }

    async fn unregister_shuffle(&self, handle: &ShuffleHandle) -> Result<()> {
        let finalizer = self.finalizer(Arc::new(handle.clone()));
        finalizer.cleanup().await
    }
}
