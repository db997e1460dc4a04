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

//! Core types and infrastructure shared by the rss master, worker and client:
//! shuffle identifiers, the on-DFS block format, the framed wire protocol,
//! the coordination-service registry, and the validated configuration layer.

pub mod block;
pub mod cluster;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod handle;
pub mod ids;
pub mod layout;
pub mod protocol;
pub mod registry;
pub mod util;

/// rss crate version, shared by all daemons for startup banners.
pub const RSS_VERSION: &str = env!("CARGO_PKG_VERSION");
