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

//! The rss client: the narrow surface a host compute engine adapts to.
//!
//! The engine registers a shuffle on the driver, fans the returned
//! [`rss_core::handle::ShuffleHandle`] out to its executors, obtains one
//! writer per map task and one reader per reduce task, and finalizes the
//! stage through [`finalizer::StageFinalizer`] when the stage completes.

use async_trait::async_trait;

use rss_core::error::Result;
use rss_core::handle::ShuffleHandle;
use rss_core::ids::StageShuffleId;

pub mod connection;
pub mod finalizer;
pub mod reader;
pub mod service_manager;
pub mod writer;

pub use reader::ShuffleReader;
pub use service_manager::ShuffleServiceManager;
pub use writer::{ShuffleDependency, ShuffleWriter};

/// The host-engine integration surface: register, get-writer, get-reader,
/// unregister. Everything else stays internal to this crate.
#[async_trait]
pub trait ShuffleService: Send + Sync {
    /// Allocates workers for a new shuffle and builds its routing handle.
    async fn register_shuffle(
        &self,
        stage: StageShuffleId,
        num_partitions: u32,
    ) -> Result<ShuffleHandle>;

    /// Opens a writer for one map attempt.
    fn get_writer(
        &self,
        handle: &ShuffleHandle,
        map_id: u32,
        map_attempt: u16,
        dependency: &ShuffleDependency,
    ) -> Result<ShuffleWriter>;

    /// Opens a reader over a partition range and a map-index range.
    fn get_reader(&self, handle: &ShuffleHandle) -> Result<ShuffleReader>;

    /// Drops client state for a shuffle and, when configured, its DFS tree.
    async fn unregister_shuffle(&self, handle: &ShuffleHandle) -> Result<()>;
}
