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

//! rss Master Process
//!
//! Runs the control server and the election loop: campaign for the leader
//! seat, and while holding it keep the worker table fed from registry
//! watches and the seat lease renewed. Losing the lease steps down and
//! re-campaigns; contenders watch the holder and race on its disappearance.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::{info, warn};
use tokio::sync::broadcast;

use rss_core::RSS_VERSION;
use rss_core::config::RssConfig;
use rss_core::error::Result;
use rss_core::registry::{Registry, RegistryEvent};
use rss_core::util::timestamp_millis;

use crate::allocator::{Allocator, WorkerTable};
use crate::server::MasterServer;

/// Listener half of the process-wide shutdown broadcast.
pub struct ShutdownSignal {
    notify: broadcast::Receiver<()>,
    seen: bool,
}

impl ShutdownSignal {
    fn new(notify: broadcast::Receiver<()>) -> Self {
        Self {
            notify,
            seen: false,
        }
    }

    pub async fn recv(&mut self) {
        if self.seen {
            return;
        }
        let _ = self.notify.recv().await;
        self.seen = true;
    }
}

/// Configuration for the master process.
pub struct MasterProcessConfig {
    pub bind_host: String,
    /// Hostname advertised in the registry; defaults to the bind host.
    pub external_host: Option<String>,
    /// Control port; 0 binds an ephemeral port.
    pub port: u16,
    pub config: RssConfig,
}

impl MasterProcessConfig {
    pub fn standalone(config: RssConfig) -> Self {
        Self {
            bind_host: "127.0.0.1".to_owned(),
            external_host: None,
            port: 0,
            config,
        }
    }
}

/// A running master. `name` is its registry identity, `host:port`.
pub struct MasterHandle {
    pub name: String,
    pub control_addr: std::net::SocketAddr,
    notify_shutdown: broadcast::Sender<()>,
    registry: Arc<dyn Registry>,
}

impl MasterHandle {
    /// Steps down and stops serving. The leader seat opens for contenders
    /// as soon as the lease is released.
    pub async fn stop(self) {
        info!("Master {} shutting down", self.name);
        let _ = self.notify_shutdown.send(());
        // Lease release happens in the election loop on shutdown; fall back
        // to a short grace period for it to run.
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(self.registry);
    }
}

pub async fn start_master_process(
    opt: MasterProcessConfig,
    registry: Arc<dyn Registry>,
) -> Result<MasterHandle> {
    let config = &opt.config;
    info!("Master starting ... (rss {RSS_VERSION})");

    let (notify_shutdown, _) = broadcast::channel::<()>(1);

    let table = Arc::new(WorkerTable::new());
    let allocator = Allocator::new(table.clone(), config);
    let server = MasterServer::new(allocator, config.max_request_size());

    let (control_addr, _serve_task) = server
        .clone()
        .serve(
            &format!("{}:{}", opt.bind_host, opt.port),
            ShutdownSignal::new(notify_shutdown.subscribe()),
        )
        .await?;

    let host = opt.external_host.unwrap_or_else(|| opt.bind_host.clone());
    let name = format!("{host}:{}", control_addr.port());

    // Election loop.
    {
        let registry = registry.clone();
        let server = server.clone();
        let table = table.clone();
        let name = name.clone();
        let data_center = config.data_center();
        let cluster = config.cluster();
        let session = Duration::from_millis(config.session_timeout_millis());
        let mut shutdown = ShutdownSignal::new(notify_shutdown.subscribe());
        tokio::spawn(async move {
            run_election_loop(
                registry,
                server,
                table,
                &name,
                &data_center,
                &cluster,
                session,
                &mut shutdown,
            )
            .await;
        });
    }

    Ok(MasterHandle {
        name,
        control_addr,
        notify_shutdown,
        registry,
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_election_loop(
    registry: Arc<dyn Registry>,
    server: Arc<MasterServer>,
    table: Arc<WorkerTable>,
    name: &str,
    data_center: &str,
    cluster: &str,
    session: Duration,
    shutdown: &mut ShutdownSignal,
) {
    let retry = session / 3;
    loop {
        let campaign = registry.elect_master(data_center, cluster, name).await;
        match campaign {
            Ok(Some(lease)) => {
                info!("Won master election for {data_center}/{cluster} as {name}");
                lead(
                    &registry, &server, &table, name, data_center, cluster, lease,
                    session, shutdown,
                )
                .await;
                server.set_leader(false);
                let _ = registry.release_lease(lease).await;
                if shutdown.seen {
                    return;
                }
                warn!("Lost master leadership for {data_center}/{cluster}; re-campaigning");
            }
            Ok(None) => {
                // Another holder; wait for the seat to open.
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = wait_for_vacancy(&registry, data_center, cluster, retry) => {}
                }
            }
            Err(e) => {
                warn!("Master campaign failed: {e}");
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = tokio::time::sleep(retry) => {}
                }
            }
        }
    }
}

/// Waits until the master key disappears (or a poll interval elapses).
async fn wait_for_vacancy(
    registry: &Arc<dyn Registry>,
    data_center: &str,
    cluster: &str,
    poll: Duration,
) {
    match registry.watch_master(data_center, cluster).await {
        Ok(mut stream) => {
            let vacancy = async {
                while let Some(event) = stream.next().await {
                    if matches!(event, RegistryEvent::MasterChanged(None)) {
                        break;
                    }
                }
            };
            // The poll timeout covers a watch stream that dies quietly.
            let _ = tokio::time::timeout(poll.max(Duration::from_millis(100)), vacancy)
                .await;
        }
        Err(e) => {
            warn!("Master watch failed: {e}");
            tokio::time::sleep(poll).await;
        }
    }
}

/// Serves as leader until the lease cannot be renewed or shutdown arrives.
#[allow(clippy::too_many_arguments)]
async fn lead(
    registry: &Arc<dyn Registry>,
    server: &Arc<MasterServer>,
    table: &Arc<WorkerTable>,
    name: &str,
    data_center: &str,
    cluster: &str,
    lease: u64,
    session: Duration,
    shutdown: &mut ShutdownSignal,
) {
    // Seed the table, then keep it current from the watch stream.
    match registry.list_workers(data_center, cluster).await {
        Ok(workers) => {
            info!("Seeded worker table with {} live workers", workers.len());
            table.replace(workers);
        }
        Err(e) => {
            warn!("Worker listing failed at takeover: {e}");
        }
    }
    let mut watch = match registry.watch_workers(data_center, cluster).await {
        Ok(watch) => Some(watch),
        Err(e) => {
            warn!("Worker watch failed: {e}; serving from the seeded table");
            None
        }
    };

    server.set_leader(true);
    info!("Master {name} is now serving allocations");

    let mut renew = tokio::time::interval(session / 3);
    renew.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    renew.tick().await;

    loop {
        let next_event = async {
            match watch.as_mut() {
                Some(stream) => stream.next().await,
                None => futures::future::pending().await,
            }
        };
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = renew.tick() => {
                if let Err(e) = registry.renew_lease(lease).await {
                    warn!("Master lease renewal failed at {}: {e}", timestamp_millis());
                    return;
                }
            }
            event = next_event => match event {
                Some(event) => table.apply(&event),
                None => {
                    warn!("Worker watch stream ended; refreshing by listing");
                    match registry.list_workers(data_center, cluster).await {
                        Ok(workers) => table.replace(workers),
                        Err(e) => warn!("Worker listing failed: {e}"),
                    }
                    watch = None;
                }
            }
        }
    }
}
