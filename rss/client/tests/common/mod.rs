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

//! In-process cluster harness: a memory registry, an in-memory DFS, one
//! elected master and N workers, all in one tokio runtime.

// Not every suite touches every helper.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use object_store::memory::InMemory;

use rss_client::reader::RecordStream;
use rss_client::service_manager::ShuffleServiceManager;
use rss_core::config::{self, RssConfig};
use rss_core::error::Result;
use rss_core::registry::{MemoryRegistry, Registry};
use rss_master::process::{MasterHandle, MasterProcessConfig, start_master_process};
use rss_worker::process::{WorkerHandle, WorkerProcessConfig, start_worker_process};

pub struct TestCluster {
    pub config: RssConfig,
    pub registry: Arc<MemoryRegistry>,
    pub store: Arc<InMemory>,
    pub master: Option<MasterHandle>,
    pub workers: Vec<WorkerHandle>,
}

/// Test-friendly defaults: small blocks, fast heartbeats, short waits.
pub fn test_config() -> RssConfig {
    RssConfig::builder()
        .set(config::RSS_BLOCK_SIZE, "1024")
        .set(config::RSS_DUMP_BLOCK_FACTOR, "2")
        .set(config::RSS_PARTITION_COUNT_PER_SHUFFLE_WORKER, "2")
        .set(config::RSS_HEARTBEAT_INTERVAL, "200")
        .set(config::RSS_SESSION_TIMEOUT, "3000")
        .set(config::RSS_NETWORK_TIMEOUT, "5000")
        .set(config::RSS_INPUT_READY_QUERY_INTERVAL, "50")
        .set(config::RSS_INPUT_READY_MAX_WAIT_TIME, "10000")
        .set(config::RSS_PARTITION_IDLE_TIMEOUT, "500")
        .build()
        .unwrap()
}

impl TestCluster {
    pub async fn start(num_workers: usize, config: RssConfig) -> Self {
        let registry = Arc::new(MemoryRegistry::new(Duration::from_millis(
            config.session_timeout_millis(),
        )));
        let store = Arc::new(InMemory::new());

        let master = start_master_process(
            MasterProcessConfig::standalone(config.clone()),
            registry.clone() as Arc<dyn Registry>,
        )
        .await
        .expect("master should start");
        wait_for_leader(&registry, &config).await;

        let mut workers = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let worker = start_worker_process(
                WorkerProcessConfig::standalone(config.clone()),
                registry.clone() as Arc<dyn Registry>,
                store.clone(),
            )
            .await
            .expect("worker should start");
            workers.push(worker);
        }
        // Let the master's watch task apply the registrations.
        tokio::time::sleep(Duration::from_millis(100)).await;

        Self {
            config,
            registry,
            store,
            master: Some(master),
            workers,
        }
    }

    pub fn manager(&self) -> Arc<ShuffleServiceManager> {
        ShuffleServiceManager::init(
            self.config.clone(),
            self.registry.clone() as Arc<dyn Registry>,
            self.store.clone(),
        )
        .expect("manager should initialize")
    }

    pub async fn stop(mut self) {
        for worker in self.workers.drain(..) {
            worker.stop().await;
        }
        if let Some(master) = self.master.take() {
            master.stop().await;
        }
    }
}

pub async fn wait_for_leader(registry: &Arc<MemoryRegistry>, config: &RssConfig) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if registry
            .get_active_master(&config.data_center(), &config.cluster())
            .await
            .unwrap()
            .is_some()
        {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no master elected within 5s"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Drains a record stream to completion.
pub async fn collect_records(mut stream: RecordStream) -> Result<Vec<Bytes>> {
    let mut records = Vec::new();
    while let Some(item) = stream.next().await {
        records.push(item?);
    }
    Ok(records)
}
