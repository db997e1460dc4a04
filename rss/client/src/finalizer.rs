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

//! Driver-side stage finalization.
//!
//! On stage success every distinct worker of the handle flushes and closes
//! its partitions; only after all of them ack does the finalizer write the
//! single `_SUCCESS` marker, so at most one success marker ever exists per
//! stage attempt. A stage re-run deletes the previous attempt's markers
//! before writing anything new.

use std::sync::Arc;

use bytes::Bytes;
use log::{info, warn};
use object_store::ObjectStore;

use rss_core::config::RssConfig;
use rss_core::error::{Result, RssError};
use rss_core::handle::ShuffleHandle;
use rss_core::ids::StageShuffleId;
use rss_core::layout;

use crate::connection::{ConnectOptions, WorkerConnection};

pub struct StageFinalizer {
    handle: Arc<ShuffleHandle>,
    store: Arc<dyn ObjectStore>,
    opts: ConnectOptions,
    delete_shuffle_dir: bool,
}

impl StageFinalizer {
    pub fn new(
        handle: Arc<ShuffleHandle>,
        store: Arc<dyn ObjectStore>,
        config: &RssConfig,
    ) -> Self {
        Self {
            handle,
            store,
            opts: ConnectOptions::from_config(config),
            delete_shuffle_dir: config.delete_shuffle_dir(),
        }
    }

    fn stage(&self) -> &StageShuffleId {
        &self.handle.stage
    }

    /// Flushes every group member, then writes the success marker.
    pub async fn commit(&self) -> Result<()> {
        for worker in self.handle.distinct_workers() {
            let mut connection = WorkerConnection::connect(
                worker,
                &self.stage().app_id,
                &self.stage().app_attempt,
                &self.opts,
            )
            .await?;
            connection.finalize_stage(self.stage()).await?;
        }
        let marker = layout::success_marker(&self.handle.cluster_conf, self.stage());
        self.store.put(&marker, Bytes::new().into()).await?;
        info!("Stage {} finalized, wrote {marker}", self.stage());
        Ok(())
    }

    /// Stage abort: best-effort failure marker plus removal of the attempt's
    /// partial part files.
    pub async fn abort(&self) {
        let marker = layout::failed_marker(&self.handle.cluster_conf, self.stage());
        if let Err(e) = self.store.put(&marker, Bytes::new().into()).await {
            warn!("Failed to write {marker}: {e}");
        }
        let stage_prefix = layout::stage_dir(&self.handle.cluster_conf, self.stage());
        let partials = {
            use futures::TryStreamExt;
            self.store
                .list(Some(&stage_prefix))
                .try_collect::<Vec<_>>()
                .await
        };
        match partials {
            Ok(objects) => {
                for meta in objects {
                    let Some(name) = meta.location.filename() else {
                        continue;
                    };
                    if layout::parse_part_file(name).is_none() {
                        continue;
                    }
                    if let Err(e) = self.store.delete(&meta.location).await {
                        warn!("Failed to delete partial {}: {e}", meta.location);
                    }
                }
            }
            Err(e) => warn!("Partial-file listing failed for {stage_prefix}: {e}"),
        }
    }

    /// Clears the previous stage attempt's markers ahead of a re-run, so a
    /// reader can never observe a stale success marker next to new data.
    pub async fn prepare_rerun(&self) -> Result<()> {
        if self.stage().stage_attempt == 0 {
            return Ok(());
        }
        let previous = StageShuffleId {
            stage_attempt: self.stage().stage_attempt - 1,
            ..self.stage().clone()
        };
        for marker in [
            layout::success_marker(&self.handle.cluster_conf, &previous),
            layout::failed_marker(&self.handle.cluster_conf, &previous),
        ] {
            match self.store.delete(&marker).await {
                Ok(()) => info!("Deleted stale marker {marker}"),
                Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(RssError::Dfs(e)),
            }
        }
        Ok(())
    }

    /// Deletes the whole shuffle tree when `delete.shuffle.dir` is set.
    pub async fn cleanup(&self) -> Result<()> {
        if !self.delete_shuffle_dir {
            return Ok(());
        }
        let prefix = layout::shuffle_dir(&self.handle.cluster_conf, self.stage());
        let objects = {
            use futures::TryStreamExt;
            self.store
                .list(Some(&prefix))
                .try_collect::<Vec<_>>()
                .await?
        };
        for meta in objects {
            if let Err(e) = self.store.delete(&meta.location).await {
                warn!("Failed to delete {}: {e}", meta.location);
            }
        }
        info!("Deleted shuffle tree {prefix}");
        Ok(())
    }
}
