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

//! Identifiers for shuffles, partitions and blocks.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Identifies one logical shuffle output: the shuffle of one stage attempt of
/// one application attempt. Equality is tuple equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageShuffleId {
    /// Application id assigned by the host engine.
    pub app_id: String,
    /// Application attempt id. Kept as an opaque string.
    pub app_attempt: String,
    /// Stage attempt number; a stage re-run bumps this.
    pub stage_attempt: u32,
    /// Shuffle id within the application.
    pub shuffle_id: u32,
}

impl StageShuffleId {
    pub fn new(
        app_id: impl Into<String>,
        app_attempt: impl Into<String>,
        stage_attempt: u32,
        shuffle_id: u32,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            app_attempt: app_attempt.into(),
            stage_attempt,
            shuffle_id,
        }
    }
}

impl Display for StageShuffleId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/shuffle-{}/stage-{}",
            self.app_id, self.app_attempt, self.shuffle_id, self.stage_attempt
        )
    }
}

/// One partition of a shuffle output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionShuffleId {
    pub stage: StageShuffleId,
    pub partition_id: u32,
}

impl PartitionShuffleId {
    pub fn new(stage: StageShuffleId, partition_id: u32) -> Self {
        Self {
            stage,
            partition_id,
        }
    }
}

impl Display for PartitionShuffleId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}/partition-{}", self.stage, self.partition_id)
    }
}

/// The idempotency fingerprint of a block within one partition.
///
/// Blocks carrying the same fingerprint are the same block: a worker acks a
/// re-delivery without re-buffering, and a reader emits the payload once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockFingerprint {
    pub map_id: u32,
    pub map_attempt: u16,
    pub seq_no: u32,
}

impl Display for BlockFingerprint {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "map-{}.{} seq-{}",
            self.map_id, self.map_attempt, self.seq_no
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn stage_identity_is_tuple_equality() {
        let a = StageShuffleId::new("app-1", "1", 0, 3);
        let b = StageShuffleId::new("app-1", "1", 0, 3);
        let c = StageShuffleId::new("app-1", "1", 1, 3);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
        assert!(!set.contains(&c));
    }

    #[test]
    fn display_forms_are_stable() {
        let stage = StageShuffleId::new("app-1", "1", 2, 7);
        let partition = PartitionShuffleId::new(stage, 11);
        assert_eq!(
            partition.to_string(),
            "app-1/1/shuffle-7/stage-2/partition-11"
        );
    }
}
