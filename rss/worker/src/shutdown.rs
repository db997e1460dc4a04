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

//! Worker shutdown coordination.
//!
//! A worker runs several long-lived tasks (the two accept loops, the
//! heartbeater, the retention sweeper) that must all wind down before the
//! process deregisters and exits. Each task subscribes under a component
//! name and selects on its [`Shutdown`] handle; tasks whose exit matters
//! for data safety additionally hold a [`DrainGuard`]. Stopping the worker
//! broadcasts the signal once and then waits, bounded by a timeout, until
//! every guard has been dropped. Stragglers are logged by name rather than
//! waited on forever, so a wedged DFS flush cannot hold the process exit
//! hostage indefinitely.

use std::io;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{broadcast, mpsc};

/// One component's view of the process-wide shutdown signal.
pub struct Shutdown {
    component: String,
    observed: bool,
    signal: broadcast::Receiver<()>,
}

impl Shutdown {
    /// True once this handle has seen the signal.
    pub fn is_shutdown(&self) -> bool {
        self.observed
    }

    /// Completes when the worker is stopping. Subsequent calls return
    /// immediately, so the handle is safe inside a `select!` loop.
    pub async fn recv(&mut self) {
        if self.observed {
            return;
        }
        let _ = self.signal.recv().await;
        self.observed = true;
        debug!("Component {} observed shutdown", self.component);
    }
}

/// Held by a component whose completion the worker waits for at exit.
/// Dropping it reports the component as drained.
pub struct DrainGuard {
    component: String,
    _done: mpsc::Sender<String>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        debug!("Component {} drained", self.component);
    }
}

/// Process-wide shutdown broadcaster and drain barrier.
pub struct ShutdownNotifier {
    signal: broadcast::Sender<()>,
    done_tx: mpsc::Sender<String>,
    done_rx: mpsc::Receiver<String>,
    guarded: Vec<String>,
}

impl ShutdownNotifier {
    pub fn new() -> Self {
        let (signal, _) = broadcast::channel(1);
        let (done_tx, done_rx) = mpsc::channel(1);
        Self {
            signal,
            done_tx,
            done_rx,
            guarded: Vec::new(),
        }
    }

    /// Registers a named listener for the shutdown signal.
    pub fn subscribe(&self, component: &str) -> Shutdown {
        Shutdown {
            component: component.to_owned(),
            observed: false,
            signal: self.signal.subscribe(),
        }
    }

    /// Registers a component the drain barrier must wait for.
    pub fn drain_guard(&mut self, component: &str) -> DrainGuard {
        self.guarded.push(component.to_owned());
        DrainGuard {
            component: component.to_owned(),
            _done: self.done_tx.clone(),
        }
    }

    /// Broadcasts shutdown and waits up to `drain_timeout` for every
    /// [`DrainGuard`] to drop. Components still running at the deadline are
    /// logged and abandoned.
    pub async fn shutdown(mut self, drain_timeout: Duration) {
        let _ = self.signal.send(());
        drop(self.done_tx);
        let drained =
            tokio::time::timeout(drain_timeout, self.done_rx.recv()).await;
        match drained {
            // The channel closes once the last guard is gone; guards never
            // send, so the first recv result is already the closed marker.
            Ok(_) => {}
            Err(_) => {
                warn!(
                    "Shutdown drain exceeded {} ms; still running: {}",
                    drain_timeout.as_millis(),
                    self.guarded.join(", ")
                );
            }
        }
    }
}

impl Default for ShutdownNotifier {
    fn default() -> Self {
        ShutdownNotifier::new()
    }
}

/// Resolves when the operating system asks the worker to terminate: SIGTERM
/// on Unix, Ctrl+Break on Windows.
pub async fn sig_term() -> io::Result<()> {
    #[cfg(unix)]
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?
        .recv()
        .await;
    #[cfg(windows)]
    tokio::signal::windows::ctrl_break()?.recv().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_the_signal_once() {
        let notifier = ShutdownNotifier::new();
        let mut a = notifier.subscribe("a");
        let mut b = notifier.subscribe("b");
        assert!(!a.is_shutdown());

        notifier.shutdown(Duration::from_millis(100)).await;

        a.recv().await;
        b.recv().await;
        assert!(a.is_shutdown());
        assert!(b.is_shutdown());
        // A second recv on an already-signalled handle returns immediately.
        a.recv().await;
    }

    #[tokio::test]
    async fn drain_waits_for_guards() {
        let mut notifier = ShutdownNotifier::new();
        let mut shutdown = notifier.subscribe("worker-loop");
        let guard = notifier.drain_guard("worker-loop");

        let task = tokio::spawn(async move {
            shutdown.recv().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        let started = tokio::time::Instant::now();
        notifier.shutdown(Duration::from_secs(2)).await;
        assert!(
            started.elapsed() >= Duration::from_millis(50),
            "shutdown returned before the guarded component finished"
        );
        task.await.unwrap();
    }

    #[tokio::test]
    async fn drain_gives_up_on_stuck_components() {
        let mut notifier = ShutdownNotifier::new();
        let _stuck = notifier.drain_guard("wedged-flush");

        let started = tokio::time::Instant::now();
        notifier.shutdown(Duration::from_millis(80)).await;
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(80));
        assert!(waited < Duration::from_secs(1));
    }
}
