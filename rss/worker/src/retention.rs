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

//! Retention sweeper: deletes application trees on the DFS that have been
//! idle past `app.storage.retention.millis` and evicts idle in-memory stage
//! state past `app.obj.retention.millis`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use log::{info, warn};
use object_store::ObjectStore;
use object_store::path::Path;
use tokio::task::JoinHandle;

use rss_core::cluster::ClusterConf;
use rss_core::error::Result;
use rss_core::layout;

use crate::shutdown::Shutdown;
use crate::storage::ShuffleStorage;

pub fn start_sweeper(
    store: Arc<dyn ObjectStore>,
    conf: ClusterConf,
    storage: Arc<ShuffleStorage>,
    storage_retention: Duration,
    sweep_interval: Duration,
    mut shutdown: Shutdown,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup stays quiet.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {
                    storage.evict_stale_stages();
                    if let Err(e) = sweep_expired_apps(
                        store.as_ref(),
                        &conf,
                        storage_retention,
                    ).await {
                        warn!("Retention sweep failed: {e}");
                    }
                }
            }
        }
    })
}

/// Deletes every `{root}/{app_id}` tree whose newest object is older than
/// the retention window. Returns the deleted app ids.
pub async fn sweep_expired_apps(
    store: &dyn ObjectStore,
    conf: &ClusterConf,
    retention: Duration,
) -> Result<Vec<String>> {
    let prefix = if conf.root_dir.is_empty() {
        None
    } else {
        Some(Path::from(conf.root_dir.clone()))
    };
    let metas = store.list(prefix.as_ref()).try_collect::<Vec<_>>().await?;

    let root_depth = if conf.root_dir.is_empty() {
        0
    } else {
        conf.root_dir.split('/').count()
    };

    let mut newest_per_app: HashMap<String, DateTime<Utc>> = HashMap::new();
    for meta in &metas {
        let parts: Vec<_> = meta.location.parts().collect();
        let Some(app) = parts.get(root_depth) else {
            continue;
        };
        let app = app.as_ref().to_owned();
        let entry = newest_per_app.entry(app).or_insert(meta.last_modified);
        if meta.last_modified > *entry {
            *entry = meta.last_modified;
        }
    }

    let now = Utc::now();
    let retention_ms = retention.as_millis() as i64;
    let mut deleted = Vec::new();
    for (app, newest) in newest_per_app {
        let age_ms = now.signed_duration_since(newest).num_milliseconds();
        if age_ms <= retention_ms {
            continue;
        }
        info!("Deleting expired shuffle data of app {app} (idle {age_ms} ms)");
        let app_prefix = layout::app_dir(conf, &app);
        let stale = store
            .list(Some(&app_prefix))
            .try_collect::<Vec<_>>()
            .await?;
        for meta in stale {
            if let Err(e) = store.delete(&meta.location).await {
                warn!("Failed to delete {}: {e}", meta.location);
            }
        }
        deleted.push(app);
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn conf() -> ClusterConf {
        ClusterConf {
            root_dir: "shuffle".to_owned(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fresh_apps_survive_the_sweep() {
        let store = InMemory::new();
        store
            .put(
                &Path::from("shuffle/app-1/1/0/stage-0/partition-0/part-w-00000"),
                bytes::Bytes::from_static(b"data").into(),
            )
            .await
            .unwrap();

        let deleted = sweep_expired_apps(&store, &conf(), Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(deleted.is_empty());
        assert_eq!(store.list(None).try_collect::<Vec<_>>().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn idle_apps_are_deleted() {
        let store = InMemory::new();
        for p in 0..3 {
            store
                .put(
                    &Path::from(format!(
                        "shuffle/app-old/1/0/stage-0/partition-{p}/part-w-00000"
                    )),
                    bytes::Bytes::from_static(b"data").into(),
                )
                .await
                .unwrap();
        }

        // Zero retention: everything with any age is expired.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let deleted = sweep_expired_apps(&store, &conf(), Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(deleted, vec!["app-old".to_owned()]);
        assert!(store.list(None).try_collect::<Vec<_>>().await.unwrap().is_empty());
    }
}
