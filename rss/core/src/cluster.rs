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

//! Cluster membership types: worker descriptors, worker groups and the
//! cluster configuration blob handed to clients at allocation time.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RssError};

/// A registered shuffle worker as published in the registry and returned by
/// the master allocator. `(host, data_port)` is unique within a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerDetail {
    pub host: String,
    pub data_port: u16,
    pub control_port: u16,
    /// Load weight used by the allocator; always >= 1.
    pub weight: u32,
    pub data_center: String,
    pub cluster: String,
    /// Epoch millis of the last registry heartbeat.
    pub last_heartbeat: u64,
}

impl WorkerDetail {
    /// Registry name of this worker, `host:data_port`.
    pub fn name(&self) -> String {
        format!("{}:{}", self.host, self.data_port)
    }

    pub fn data_addr(&self) -> String {
        format!("{}:{}", self.host, self.data_port)
    }

    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.host, self.control_port)
    }
}

/// The ordered, duplicate-free set of workers serving one group of
/// partitions. Immutable for the lifetime of a shuffle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerGroup {
    workers: Vec<WorkerDetail>,
}

impl ServerGroup {
    pub fn new(workers: Vec<WorkerDetail>) -> Result<Self> {
        if workers.is_empty() {
            return Err(RssError::Internal(
                "a server group must contain at least one worker".to_owned(),
            ));
        }
        for (i, w) in workers.iter().enumerate() {
            if workers[..i].iter().any(|o| o.name() == w.name()) {
                return Err(RssError::Internal(format!(
                    "duplicate worker {} in server group",
                    w.name()
                )));
            }
        }
        Ok(Self { workers })
    }

    pub fn workers(&self) -> &[WorkerDetail] {
        &self.workers
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// The group member serving a partition. All blocks and all map attempts
    /// of one partition land on the same member.
    pub fn member_for_partition(&self, partition_id: u32) -> &WorkerDetail {
        let idx = scramble(partition_id) as usize % self.workers.len();
        &self.workers[idx]
    }
}

/// Fibonacci scramble so partitions spread over group members even when
/// partition ids share the group-assignment residue.
fn scramble(partition_id: u32) -> u32 {
    ((partition_id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as u32
}

/// Weighted random sampling without replacement.
///
/// Each worker draws the key `u^(1/weight)` with `u` uniform in (0, 1]; the
/// `count` largest keys win, so selection probability is proportional to the
/// load weight. Key ties fall back to the healthiest heartbeat, then
/// lexicographic host:port. Shared by the master allocator and the
/// registry-direct allocation mode of the client.
pub fn weighted_sample<R: Rng + ?Sized>(
    workers: &[WorkerDetail],
    count: usize,
    rng: &mut R,
) -> Vec<WorkerDetail> {
    let mut keyed: Vec<(f64, &WorkerDetail)> = workers
        .iter()
        .map(|worker| {
            let weight = worker.weight.max(1) as f64;
            let u: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
            (u.powf(1.0 / weight), worker)
        })
        .collect();
    keyed.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.1.last_heartbeat.cmp(&a.1.last_heartbeat))
            .then_with(|| a.1.name().cmp(&b.1.name()))
    });
    keyed
        .into_iter()
        .take(count)
        .map(|(_, worker)| worker.clone())
        .collect()
}

/// Cluster-wide configuration returned with every allocation: where shuffle
/// data lives and which dc/cluster produced the assignment. `dfs_site` is an
/// opaque blob forwarded to the DFS layer untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConf {
    pub root_dir: String,
    pub data_center: String,
    pub cluster: String,
    pub dfs_site: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn worker(host: &str, port: u16) -> WorkerDetail {
        WorkerDetail {
            host: host.to_owned(),
            data_port: port,
            control_port: port + 1,
            weight: 1,
            data_center: "dc1".to_owned(),
            cluster: "default".to_owned(),
            last_heartbeat: 0,
        }
    }

    #[test]
    fn group_rejects_duplicates() {
        let g = ServerGroup::new(vec![worker("a", 1000), worker("a", 1000)]);
        assert!(g.is_err());
    }

    #[test]
    fn sampling_has_no_replacement() {
        use rand::SeedableRng;
        let workers: Vec<_> = (0..8).map(|i| worker(&format!("h{i}"), 1000)).collect();
        let mut rng = rand::rngs::StdRng::seed_from_u64(5);
        let selected = weighted_sample(&workers, 8, &mut rng);
        assert_eq!(selected.len(), 8);
        let mut names: Vec<_> = selected.iter().map(|w| w.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 8);
    }

    #[test]
    fn heavier_workers_are_picked_more_often() {
        use rand::SeedableRng;
        let mut heavy = worker("heavy", 1000);
        heavy.weight = 8;
        let light = worker("light", 1001);
        let workers = vec![heavy, light];
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut heavy_hits = 0usize;
        for _ in 0..2000 {
            let selected = weighted_sample(&workers, 1, &mut rng);
            if selected[0].host == "heavy" {
                heavy_hits += 1;
            }
        }
        let light_hits = 2000 - heavy_hits;
        assert!(
            heavy_hits > light_hits * 3,
            "expected weight-proportional selection, got heavy={heavy_hits} light={light_hits}"
        );
    }

    #[test]
    fn member_selection_is_stable_and_in_range() {
        let group =
            ServerGroup::new(vec![worker("a", 1000), worker("b", 1000), worker("c", 1000)])
                .unwrap();
        for p in 0..100u32 {
            let first = group.member_for_partition(p).name();
            let second = group.member_for_partition(p).name();
            assert_eq!(first, second);
        }
        // All members serve some partition.
        let mut hit = [false; 3];
        for p in 0..100u32 {
            let name = group.member_for_partition(p).name();
            let idx = group.workers().iter().position(|w| w.name() == name).unwrap();
            hit[idx] = true;
        }
        assert!(hit.iter().all(|h| *h));
    }
}
