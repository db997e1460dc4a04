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

//! The driver-side shuffle handle: an immutable routing table built once per
//! `register_shuffle` and fanned out to every executor.
//!
//! Groups are built by a sliding window over a uniformly shuffled worker
//! list, so groups overlap but stay distinct, spreading partition load while
//! giving each partition a small fixed target set for all its map attempts.
//! Partitions map onto groups by `p mod groups.len()`.

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterConf, ServerGroup, WorkerDetail};
use crate::error::{Result, RssError};
use crate::ids::StageShuffleId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShuffleHandle {
    pub stage: StageShuffleId,
    pub num_partitions: u32,
    /// partition id -> index into `groups`.
    pub partition_map: Vec<u32>,
    pub groups: Vec<ServerGroup>,
    pub cluster_conf: ClusterConf,
}

impl ShuffleHandle {
    /// Builds a handle from the workers the allocator returned.
    pub fn build(
        stage: StageShuffleId,
        num_partitions: u32,
        workers: Vec<WorkerDetail>,
        workers_per_group: usize,
        cluster_conf: ClusterConf,
    ) -> Result<Self> {
        Self::build_with_rng(
            stage,
            num_partitions,
            workers,
            workers_per_group,
            cluster_conf,
            &mut rand::thread_rng(),
        )
    }

    pub fn build_with_rng<R: Rng + ?Sized>(
        stage: StageShuffleId,
        num_partitions: u32,
        mut workers: Vec<WorkerDetail>,
        workers_per_group: usize,
        cluster_conf: ClusterConf,
        rng: &mut R,
    ) -> Result<Self> {
        if workers.is_empty() {
            return Err(RssError::NoShuffleWorkers(format!(
                "cannot build a shuffle handle for {stage} without workers"
            )));
        }
        if num_partitions == 0 {
            return Err(RssError::Configuration(format!(
                "shuffle {stage} registered with zero partitions"
            )));
        }
        let window = workers_per_group.max(1);

        workers.shuffle(rng);

        // One group per worker: a window of `workers_per_group` starting at
        // each position, wrapping at the end. Duplicates inside a window
        // (worker count below the window size) collapse.
        let mut groups = Vec::with_capacity(workers.len());
        for start in 0..workers.len() {
            let mut members: Vec<WorkerDetail> = Vec::with_capacity(window);
            for offset in 0..window {
                let candidate = &workers[(start + offset) % workers.len()];
                if !members.iter().any(|m| m.name() == candidate.name()) {
                    members.push(candidate.clone());
                }
            }
            groups.push(ServerGroup::new(members)?);
        }

        let partition_map = (0..num_partitions)
            .map(|p| p % groups.len() as u32)
            .collect();

        Ok(Self {
            stage,
            num_partitions,
            partition_map,
            groups,
            cluster_conf,
        })
    }

    pub fn group_for_partition(&self, partition_id: u32) -> &ServerGroup {
        let group_idx = self.partition_map[partition_id as usize] as usize;
        &self.groups[group_idx]
    }

    /// The single worker all blocks of `partition_id` are routed to.
    pub fn worker_for_partition(&self, partition_id: u32) -> &WorkerDetail {
        self.group_for_partition(partition_id)
            .member_for_partition(partition_id)
    }

    /// Every distinct worker referenced by any group, for stage finalize.
    pub fn distinct_workers(&self) -> Vec<&WorkerDetail> {
        let mut seen: Vec<&WorkerDetail> = Vec::new();
        for group in &self.groups {
            for worker in group.workers() {
                if !seen.iter().any(|w| w.name() == worker.name()) {
                    seen.push(worker);
                }
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn workers(n: u16) -> Vec<WorkerDetail> {
        (0..n)
            .map(|i| WorkerDetail {
                host: format!("host-{i}"),
                data_port: 21000,
                control_port: 21001,
                weight: 1,
                data_center: "dc1".to_owned(),
                cluster: "default".to_owned(),
                last_heartbeat: 0,
            })
            .collect()
    }

    fn stage() -> StageShuffleId {
        StageShuffleId::new("app-1", "1", 0, 0)
    }

    #[test]
    fn groups_have_window_size_and_no_duplicates() {
        let mut rng = StdRng::seed_from_u64(7);
        let handle = ShuffleHandle::build_with_rng(
            stage(),
            16,
            workers(5),
            2,
            ClusterConf::default(),
            &mut rng,
        )
        .unwrap();
        assert_eq!(handle.groups.len(), 5);
        for group in &handle.groups {
            assert_eq!(group.len(), 2);
        }
    }

    #[test]
    fn window_collapses_when_workers_are_scarce() {
        let mut rng = StdRng::seed_from_u64(7);
        let handle = ShuffleHandle::build_with_rng(
            stage(),
            4,
            workers(1),
            3,
            ClusterConf::default(),
            &mut rng,
        )
        .unwrap();
        assert_eq!(handle.groups.len(), 1);
        assert_eq!(handle.groups[0].len(), 1);
    }

    #[test]
    fn partition_assignment_is_balanced_within_one() {
        let mut rng = StdRng::seed_from_u64(11);
        let handle = ShuffleHandle::build_with_rng(
            stage(),
            103,
            workers(4),
            2,
            ClusterConf::default(),
            &mut rng,
        )
        .unwrap();
        let mut counts = vec![0usize; handle.groups.len()];
        for p in 0..handle.num_partitions {
            counts[handle.partition_map[p as usize] as usize] += 1;
        }
        let min = counts.iter().min().unwrap();
        let max = counts.iter().max().unwrap();
        assert!(max - min <= 1, "unbalanced assignment: {counts:?}");
    }

    #[test]
    fn partition_routing_is_stable() {
        let mut rng = StdRng::seed_from_u64(3);
        let handle = ShuffleHandle::build_with_rng(
            stage(),
            32,
            workers(6),
            2,
            ClusterConf::default(),
            &mut rng,
        )
        .unwrap();
        for p in 0..32 {
            assert_eq!(
                handle.worker_for_partition(p).name(),
                handle.worker_for_partition(p).name()
            );
        }
        let distinct = handle.distinct_workers();
        assert_eq!(distinct.len(), 6);
    }
}
