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

//! DFS directory layout. Compatibility-sensitive: readers, writers and the
//! retention sweeper all derive paths from here and nowhere else.
//!
//! ```text
//! {root}/{app_id}/{app_attempt}/{shuffle_id}/stage-{stage_attempt}/
//!     partition-{p}/part-{worker_id}-{seq}
//!     _SUCCESS
//!     _FAILED
//! ```

use object_store::path::Path;

use crate::cluster::ClusterConf;
use crate::ids::StageShuffleId;

pub const SUCCESS_MARKER: &str = "_SUCCESS";
pub const FAILED_MARKER: &str = "_FAILED";

fn join(root: &str, rest: String) -> Path {
    if root.is_empty() {
        Path::from(rest)
    } else {
        Path::from(format!("{root}/{rest}"))
    }
}

/// `{root}/{app_id}`: the unit of storage retention.
pub fn app_dir(conf: &ClusterConf, app_id: &str) -> Path {
    join(&conf.root_dir, app_id.to_owned())
}

/// `{root}/{app_id}/{app_attempt}/{shuffle_id}`: the whole shuffle tree,
/// spanning all stage attempts.
pub fn shuffle_dir(conf: &ClusterConf, stage: &StageShuffleId) -> Path {
    join(
        &conf.root_dir,
        format!("{}/{}/{}", stage.app_id, stage.app_attempt, stage.shuffle_id),
    )
}

/// `.../stage-{stage_attempt}`: one stage attempt's output.
pub fn stage_dir(conf: &ClusterConf, stage: &StageShuffleId) -> Path {
    join(
        &conf.root_dir,
        format!(
            "{}/{}/{}/stage-{}",
            stage.app_id, stage.app_attempt, stage.shuffle_id, stage.stage_attempt
        ),
    )
}

/// `.../partition-{p}`: all part files for one partition.
pub fn partition_dir(conf: &ClusterConf, stage: &StageShuffleId, partition_id: u32) -> Path {
    Path::from(format!("{}/partition-{partition_id}", stage_dir(conf, stage)))
}

/// `.../partition-{p}/part-{worker_id}-{seq}`: one sequential flush.
pub fn part_file(
    conf: &ClusterConf,
    stage: &StageShuffleId,
    partition_id: u32,
    worker_id: &str,
    seq: u32,
) -> Path {
    Path::from(format!(
        "{}/part-{worker_id}-{seq:05}",
        partition_dir(conf, stage, partition_id)
    ))
}

pub fn success_marker(conf: &ClusterConf, stage: &StageShuffleId) -> Path {
    Path::from(format!("{}/{SUCCESS_MARKER}", stage_dir(conf, stage)))
}

pub fn failed_marker(conf: &ClusterConf, stage: &StageShuffleId) -> Path {
    Path::from(format!("{}/{FAILED_MARKER}", stage_dir(conf, stage)))
}

/// Parses `part-{worker_id}-{seq}` back into its components. Readers sort
/// part files by `(worker_id, seq)` to recover flush order.
pub fn parse_part_file(filename: &str) -> Option<(String, u32)> {
    let rest = filename.strip_prefix("part-")?;
    let (worker_id, seq) = rest.rsplit_once('-')?;
    let seq = seq.parse::<u32>().ok()?;
    if worker_id.is_empty() {
        return None;
    }
    Some((worker_id.to_owned(), seq))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf(root: &str) -> ClusterConf {
        ClusterConf {
            root_dir: root.to_owned(),
            data_center: "dc1".to_owned(),
            cluster: "default".to_owned(),
            dfs_site: String::new(),
        }
    }

    fn stage() -> StageShuffleId {
        StageShuffleId::new("app-1", "1", 2, 9)
    }

    #[test]
    fn paths_follow_the_layout() {
        let c = conf("shuffle-root");
        assert_eq!(
            stage_dir(&c, &stage()).as_ref(),
            "shuffle-root/app-1/1/9/stage-2"
        );
        assert_eq!(
            part_file(&c, &stage(), 4, "w1", 7).as_ref(),
            "shuffle-root/app-1/1/9/stage-2/partition-4/part-w1-00007"
        );
        assert_eq!(
            success_marker(&c, &stage()).as_ref(),
            "shuffle-root/app-1/1/9/stage-2/_SUCCESS"
        );
    }

    #[test]
    fn empty_root_is_supported() {
        let c = conf("");
        assert_eq!(app_dir(&c, "app-1").as_ref(), "app-1");
        assert_eq!(stage_dir(&c, &stage()).as_ref(), "app-1/1/9/stage-2");
    }

    #[test]
    fn part_file_names_round_trip() {
        let c = conf("");
        let path = part_file(&c, &stage(), 0, "3f2a", 123);
        let name = path.filename().unwrap().to_owned();
        assert_eq!(parse_part_file(&name), Some(("3f2a".to_owned(), 123)));
        assert_eq!(parse_part_file("_SUCCESS"), None);
        assert_eq!(parse_part_file("part--5"), None);
    }
}
