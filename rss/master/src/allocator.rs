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

//! The worker table and the allocation algorithm.
//!
//! The table is copy-on-write: readers clone an `Arc` snapshot and never
//! block registrations. Selection is weighted random sampling without
//! replacement, a worker's probability proportional to its load weight,
//! with ties broken by (most recent heartbeat, lexicographic host:port).

use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;

use rss_core::cluster::{ClusterConf, WorkerDetail, weighted_sample};
use rss_core::config::RssConfig;
use rss_core::error::{Result, RssError};
use rss_core::protocol::{GetShuffleWorkersReply, GetShuffleWorkersRequest};
use rss_core::registry::RegistryEvent;

/// Copy-on-write table of live workers.
#[derive(Default)]
pub struct WorkerTable {
    inner: RwLock<Arc<Vec<WorkerDetail>>>,
}

impl WorkerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<Vec<WorkerDetail>> {
        self.inner.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces the whole table, e.g. when seeding from a registry listing.
    pub fn replace(&self, workers: Vec<WorkerDetail>) {
        *self.inner.write() = Arc::new(workers);
    }

    /// Applies one registry watch event by building a new snapshot.
    pub fn apply(&self, event: &RegistryEvent) {
        match event {
            RegistryEvent::WorkerJoined(detail) => {
                let mut next: Vec<WorkerDetail> = self
                    .snapshot()
                    .iter()
                    .filter(|w| w.name() != detail.name())
                    .cloned()
                    .collect();
                next.push(detail.clone());
                self.replace(next);
            }
            RegistryEvent::WorkerLeft(name) => {
                let next: Vec<WorkerDetail> = self
                    .snapshot()
                    .iter()
                    .filter(|w| &w.name() != name)
                    .cloned()
                    .collect();
                self.replace(next);
            }
            RegistryEvent::MasterChanged(_) => {}
        }
    }
}

pub struct Allocator {
    table: Arc<WorkerTable>,
    min_server_count: usize,
    max_server_count: usize,
    cluster_conf: ClusterConf,
}

impl Allocator {
    pub fn new(table: Arc<WorkerTable>, config: &RssConfig) -> Self {
        Self {
            table,
            min_server_count: config.min_server_count().max(1),
            max_server_count: config.max_server_count().max(1),
            cluster_conf: ClusterConf {
                root_dir: config.storage_root(),
                data_center: config.data_center(),
                cluster: config.cluster(),
                dfs_site: config.dfs_site(),
            },
        }
    }

    pub fn cluster_conf(&self) -> &ClusterConf {
        &self.cluster_conf
    }

    /// Answers one allocation request. Read-only and safe to re-issue; on
    /// leader loss clients simply retry against the new leader.
    pub fn get_shuffle_workers(
        &self,
        request: &GetShuffleWorkersRequest,
    ) -> Result<GetShuffleWorkersReply> {
        let snapshot = self.table.snapshot();
        let live: Vec<WorkerDetail> = snapshot
            .iter()
            .filter(|w| {
                w.data_center == request.data_center && w.cluster == request.cluster
            })
            .cloned()
            .collect();
        if live.is_empty() {
            return Err(RssError::NoShuffleWorkers(format!(
                "no live workers in {}/{} for app {}",
                request.data_center, request.cluster, request.app_id
            )));
        }

        let desired = request
            .requested_count
            .clamp(self.min_server_count, self.max_server_count)
            .min(live.len());
        let workers = weighted_sample(&live, desired, &mut rand::thread_rng());
        debug!(
            "Allocated {} of {} workers for app {} (requested {})",
            workers.len(),
            live.len(),
            request.app_id,
            request.requested_count
        );

        Ok(GetShuffleWorkersReply {
            workers,
            cluster_conf: self.cluster_conf.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rss_core::config::{RSS_MAX_SERVER_COUNT, RSS_MIN_SERVER_COUNT};

    fn worker(host: &str, weight: u32) -> WorkerDetail {
        WorkerDetail {
            host: host.to_owned(),
            data_port: 21000,
            control_port: 21001,
            weight,
            data_center: "default".to_owned(),
            cluster: "default".to_owned(),
            last_heartbeat: 100,
        }
    }

    fn request(count: usize) -> GetShuffleWorkersRequest {
        GetShuffleWorkersRequest {
            data_center: "default".to_owned(),
            cluster: "default".to_owned(),
            app_id: "app-1".to_owned(),
            dag_id: "dag-0".to_owned(),
            priority: 0,
            task_id: "t".to_owned(),
            app_name: "test".to_owned(),
            requested_count: count,
        }
    }

    #[test]
    fn empty_table_is_a_typed_error() {
        let allocator = Allocator::new(
            Arc::new(WorkerTable::new()),
            &RssConfig::new().unwrap(),
        );
        let err = allocator.get_shuffle_workers(&request(2)).unwrap_err();
        assert!(matches!(err, RssError::NoShuffleWorkers(_)));
    }

    #[test]
    fn requested_count_is_clamped() {
        let table = Arc::new(WorkerTable::new());
        table.replace((0..10).map(|i| worker(&format!("h{i}"), 1)).collect());
        let config = RssConfig::builder()
            .set(RSS_MIN_SERVER_COUNT, "2")
            .set(RSS_MAX_SERVER_COUNT, "4")
            .build()
            .unwrap();
        let allocator = Allocator::new(table, &config);

        assert_eq!(allocator.get_shuffle_workers(&request(1)).unwrap().workers.len(), 2);
        assert_eq!(allocator.get_shuffle_workers(&request(3)).unwrap().workers.len(), 3);
        assert_eq!(allocator.get_shuffle_workers(&request(100)).unwrap().workers.len(), 4);
    }

    #[test]
    fn table_applies_watch_events() {
        let table = WorkerTable::new();
        let a = worker("a", 1);
        table.apply(&RegistryEvent::WorkerJoined(a.clone()));
        table.apply(&RegistryEvent::WorkerJoined(worker("b", 1)));
        assert_eq!(table.len(), 2);

        // Re-join replaces rather than duplicates.
        table.apply(&RegistryEvent::WorkerJoined(a.clone()));
        assert_eq!(table.len(), 2);

        table.apply(&RegistryEvent::WorkerLeft(a.name()));
        assert_eq!(table.len(), 1);
        assert_eq!(table.snapshot()[0].host, "b");
    }
}
