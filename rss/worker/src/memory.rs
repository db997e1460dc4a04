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

//! The worker's memory governor: one atomic counter of resident buffered
//! bytes with waiter notification.
//!
//! Block appends reserve against it and are refused outright above the
//! threshold (the refusal becomes a transient `BackpressureError` on the
//! wire); dumpers release after each DFS write. Draining below the low-water
//! mark wakes waiters.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;

pub struct MemoryGovernor {
    threshold: u64,
    low_water: u64,
    used: AtomicU64,
    drained: Notify,
}

impl MemoryGovernor {
    pub fn new(threshold: u64, low_water_ratio: f64) -> Self {
        let ratio = low_water_ratio.clamp(0.0, 1.0);
        Self {
            threshold,
            low_water: (threshold as f64 * ratio) as u64,
            used: AtomicU64::new(0),
            drained: Notify::new(),
        }
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// True once resident bytes pass the low-water mark; the storage layer
    /// starts draining here so refusals at the threshold stay rare.
    pub fn over_low_water(&self) -> bool {
        self.used() > self.low_water
    }

    /// Reserves `bytes` of resident memory. Fails without parking when the
    /// reservation would cross the threshold.
    pub fn try_reserve(&self, bytes: u64) -> bool {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(bytes);
            if next > self.threshold {
                return false;
            }
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Returns `bytes` after a flush or a rejected append.
    pub fn release(&self, bytes: u64) {
        let before = self.used.fetch_sub(bytes, Ordering::AcqRel);
        let after = before.saturating_sub(bytes);
        if before > self.low_water && after <= self.low_water {
            self.drained.notify_waiters();
        }
    }

    /// Waits until resident bytes drop to the low-water mark.
    pub async fn wait_drained(&self) {
        loop {
            if self.used() <= self.low_water {
                return;
            }
            let notified = self.drained.notified();
            if self.used() <= self.low_water {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn reservations_respect_the_threshold() {
        let governor = MemoryGovernor::new(100, 0.75);
        assert!(governor.try_reserve(60));
        assert!(governor.try_reserve(40));
        assert!(!governor.try_reserve(1));
        governor.release(50);
        assert!(governor.try_reserve(50));
        assert_eq!(governor.used(), 100);
    }

    #[test]
    fn low_water_tracks_the_ratio() {
        let governor = MemoryGovernor::new(100, 0.75);
        assert!(governor.try_reserve(80));
        assert!(governor.over_low_water());
        governor.release(10);
        assert!(!governor.over_low_water());
    }

    #[tokio::test]
    async fn waiters_wake_on_drain() {
        let governor = Arc::new(MemoryGovernor::new(100, 0.5));
        assert!(governor.try_reserve(100));

        let waiter = {
            let governor = governor.clone();
            tokio::spawn(async move {
                governor.wait_drained().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        governor.release(60);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake after drain")
            .unwrap();
    }
}
