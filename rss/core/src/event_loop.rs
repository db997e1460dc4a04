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

//! Event loop infrastructure for asynchronous message processing.
//!
//! The worker routes all flush scheduling through one of these so that dump
//! policy decisions are serialized without a global lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use log::{error, info};
use tokio::sync::mpsc;

use crate::error::{Result, RssError};

/// Handler invoked for every event posted to an [`EventLoop`].
#[async_trait]
pub trait EventAction<E>: Send + Sync {
    /// Processes one event. May post follow-up events through the sender.
    async fn on_receive(&self, event: E, poster: &EventSender<E>) -> Result<()>;

    /// Called when event processing fails; the loop keeps running.
    fn on_error(&self, error: RssError);
}

/// An asynchronous event loop draining a bounded channel.
pub struct EventLoop<E> {
    name: String,
    buffer_size: usize,
    stopped: Arc<AtomicBool>,
    action: Arc<dyn EventAction<E>>,
    tx_event: Option<mpsc::Sender<E>>,
}

impl<E: Send + 'static> EventLoop<E> {
    pub fn new(
        name: impl Into<String>,
        buffer_size: usize,
        action: Arc<dyn EventAction<E>>,
    ) -> Self {
        Self {
            name: name.into(),
            buffer_size,
            stopped: Arc::new(AtomicBool::new(false)),
            action,
            tx_event: None,
        }
    }

    /// Starts the loop, spawning a background task to drain events.
    pub fn start(&mut self) -> Result<EventSender<E>> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RssError::Internal(format!(
                "event loop {} has already been stopped",
                self.name
            )));
        }
        let (tx_event, mut rx_event) = mpsc::channel::<E>(self.buffer_size);
        self.tx_event = Some(tx_event.clone());

        let name = self.name.clone();
        let stopped = self.stopped.clone();
        let action = self.action.clone();
        let poster = EventSender::new(tx_event);
        let loop_poster = poster.clone();
        tokio::spawn(async move {
            info!("Starting the event loop {name}");
            while !stopped.load(Ordering::SeqCst) {
                match rx_event.recv().await {
                    Some(event) => {
                        if let Err(e) = action.on_receive(event, &loop_poster).await {
                            error!("Event loop {name} failed to process event: {e}");
                            action.on_error(e);
                        }
                    }
                    None => break,
                }
            }
            info!("The event loop {name} has been stopped");
        });
        Ok(poster)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn sender(&self) -> Result<EventSender<E>> {
        self.tx_event
            .as_ref()
            .cloned()
            .map(EventSender::new)
            .ok_or_else(|| {
                RssError::Internal(format!("event loop {} not started", self.name))
            })
    }
}

/// A handle for posting events to a running [`EventLoop`].
pub struct EventSender<E> {
    tx_event: mpsc::Sender<E>,
}

impl<E> Clone for EventSender<E> {
    fn clone(&self) -> Self {
        Self {
            tx_event: self.tx_event.clone(),
        }
    }
}

impl<E> EventSender<E> {
    pub fn new(tx_event: mpsc::Sender<E>) -> Self {
        Self { tx_event }
    }

    pub async fn post(&self, event: E) -> Result<()> {
        self.tx_event
            .send(event)
            .await
            .map_err(|_| RssError::Internal("event loop receiver dropped".to_owned()))
    }

    /// Non-blocking post for callers that must not wait; drops the event if
    /// the queue is full and reports whether it was accepted.
    pub fn try_post(&self, event: E) -> bool {
        self.tx_event.try_send(event).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl EventAction<usize> for Counter {
        async fn on_receive(
            &self,
            event: usize,
            _poster: &EventSender<usize>,
        ) -> Result<()> {
            self.seen.fetch_add(event, Ordering::SeqCst);
            Ok(())
        }

        fn on_error(&self, _error: RssError) {}
    }

    #[tokio::test]
    async fn events_are_processed_in_order() {
        let action = Arc::new(Counter {
            seen: AtomicUsize::new(0),
        });
        let mut event_loop = EventLoop::new("test", 16, action.clone());
        let sender = event_loop.start().unwrap();
        for i in 1..=10 {
            sender.post(i).await.unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(action.seen.load(Ordering::SeqCst), 55);
        event_loop.stop();
    }
}
