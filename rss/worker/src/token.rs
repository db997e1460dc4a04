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

//! Flow-control tokens gating concurrent upstream connections.
//!
//! The shared pool holds `base_connections` tokens with burst capacity up to
//! `total_connections`. `OpenConnection` draws from base first, then burst,
//! then parks on the base pool until a token returns or the caller deadline
//! elapses. Dropping a [`ConnectionToken`] returns the token.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use rss_core::error::{Result, RssError};

pub struct ConnectionTokens {
    base: Arc<Semaphore>,
    burst: Arc<Semaphore>,
}

/// A held token. Returned to its pool on drop.
#[derive(Debug)]
pub struct ConnectionToken {
    _permit: OwnedSemaphorePermit,
}

impl ConnectionTokens {
    pub fn new(base_connections: usize, total_connections: usize) -> Self {
        let base = base_connections.max(1);
        let burst = total_connections.saturating_sub(base);
        Self {
            base: Arc::new(Semaphore::new(base)),
            burst: Arc::new(Semaphore::new(burst)),
        }
    }

    pub fn available(&self) -> usize {
        self.base.available_permits() + self.burst.available_permits()
    }

    /// Acquires a token within `wait`, preferring the base pool.
    pub async fn acquire(&self, wait: Duration) -> Result<ConnectionToken> {
        if let Ok(permit) = self.base.clone().try_acquire_owned() {
            return Ok(ConnectionToken { _permit: permit });
        }
        if let Ok(permit) = self.burst.clone().try_acquire_owned() {
            return Ok(ConnectionToken { _permit: permit });
        }
        match tokio::time::timeout(wait, self.base.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(ConnectionToken { _permit: permit }),
            Ok(Err(_)) => Err(RssError::Internal(
                "connection token pool closed".to_owned(),
            )),
            Err(_) => Err(RssError::NoToken(format!(
                "no connection token within {} ms",
                wait.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_extends_the_base_pool() {
        let tokens = ConnectionTokens::new(1, 3);
        let a = tokens.acquire(Duration::from_millis(10)).await.unwrap();
        let b = tokens.acquire(Duration::from_millis(10)).await.unwrap();
        let c = tokens.acquire(Duration::from_millis(10)).await.unwrap();
        assert_eq!(tokens.available(), 0);

        let err = tokens.acquire(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, RssError::NoToken(_)));

        drop(a);
        let _d = tokens.acquire(Duration::from_millis(10)).await.unwrap();
        drop(b);
        drop(c);
    }

    #[tokio::test]
    async fn blocked_acquirer_gets_a_returned_token() {
        let tokens = Arc::new(ConnectionTokens::new(1, 1));
        let held = tokens.acquire(Duration::from_millis(10)).await.unwrap();

        let waiter = {
            let tokens = tokens.clone();
            tokio::spawn(async move { tokens.acquire(Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        let token = waiter.await.unwrap();
        assert!(token.is_ok());
    }
}
