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
//

//! rss configuration

use std::collections::HashMap;
use std::result;

use crate::error::{Result, RssError};

pub const RSS_BLOCK_SIZE: &str = "rss.block.size";
pub const RSS_MAX_REQUEST_SIZE: &str = "rss.max.request.size";
pub const RSS_MAX_FLYING_PACKAGE_NUM: &str = "rss.max.flying.package.num";
pub const RSS_MEMORY_THRESHOLD: &str = "rss.writer.memory.threshold";
pub const RSS_WRITER_BUFFER_SPILL: &str = "rss.writer.buffer.spill";
pub const RSS_WRITER_TYPE: &str = "rss.writer.type";
pub const RSS_BYPASS_THRESHOLD: &str = "rss.writer.bypass.threshold";
pub const RSS_PARTITION_COUNT_PER_SHUFFLE_WORKER: &str =
    "rss.partition.count.per.shuffle.worker";
pub const RSS_WORKERS_PER_GROUP: &str = "rss.workers.per.group";
pub const RSS_MIN_SERVER_COUNT: &str = "rss.min.server.count";
pub const RSS_MAX_SERVER_COUNT: &str = "rss.max.server.count";
pub const RSS_READ_IO_THREADS: &str = "rss.read.io.threads";
pub const RSS_READ_MAX_SIZE: &str = "rss.read.max.size";
pub const RSS_READ_MERGE_SIZE: &str = "rss.read.merge.size";
pub const RSS_INPUT_READY_QUERY_INTERVAL: &str = "rss.input.ready.query.interval";
pub const RSS_INPUT_READY_MAX_WAIT_TIME: &str = "rss.input.ready.max.wait.time";
pub const RSS_DELETE_SHUFFLE_DIR: &str = "rss.delete.shuffle.dir";
pub const RSS_SERVICE_MANAGER_TYPE: &str = "rss.service.manager.type";
pub const RSS_NETWORK_TIMEOUT: &str = "rss.network.timeout";
pub const RSS_NETWORK_RETRIES: &str = "rss.network.retries";
pub const RSS_APP_STORAGE_RETENTION_MILLIS: &str = "rss.app.storage.retention.millis";
pub const RSS_APP_OBJ_RETENTION_MILLIS: &str = "rss.app.obj.retention.millis";
pub const RSS_BASE_CONNECTIONS: &str = "rss.base.connections";
pub const RSS_TOTAL_CONNECTIONS: &str = "rss.total.connections";
pub const RSS_DUMPER_THREADS: &str = "rss.dumper.threads";
pub const RSS_DUMPER_QUEUE_SIZE: &str = "rss.dumper.queue.size";
pub const RSS_MEMORY_CONTROL_SIZE_THRESHOLD: &str = "rss.memory.control.size.threshold";
pub const RSS_MEMORY_CONTROL_LOW_WATER_RATIO: &str =
    "rss.memory.control.low.water.ratio";
pub const RSS_DUMP_BLOCK_FACTOR: &str = "rss.dump.block.factor";
pub const RSS_PARTITION_IDLE_TIMEOUT: &str = "rss.partition.idle.timeout";
pub const RSS_HEARTBEAT_INTERVAL: &str = "rss.heartbeat.interval";
pub const RSS_SESSION_TIMEOUT: &str = "rss.session.timeout";
pub const RSS_DATA_CENTER: &str = "rss.data.center";
pub const RSS_CLUSTER: &str = "rss.cluster";
pub const RSS_STORAGE_ROOT: &str = "rss.storage.root";
pub const RSS_DFS_SITE: &str = "rss.dfs.site";

pub type ParseResult<T> = result::Result<T, String>;

/// The primitive type a configuration value must parse to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigType {
    UInt,
    UInt64,
    Float,
    Boolean,
    Utf8,
}

/// Configuration option meta-data
#[derive(Debug, Clone)]
pub struct ConfigEntry {
    name: String,
    _description: String,
    config_type: ConfigType,
    default_value: Option<String>,
}

impl ConfigEntry {
    fn new(
        name: &str,
        description: &str,
        config_type: ConfigType,
        default_value: &str,
    ) -> Self {
        Self {
            name: name.to_owned(),
            _description: description.to_owned(),
            config_type,
            default_value: Some(default_value.to_owned()),
        }
    }
}

/// Configuration with values in a valid String format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidConfiguration {
    settings: HashMap<String, String>,
    valid_entries: HashMap<String, ConfigEntry>,
}

impl PartialEq<Self> for ConfigEntry {
    fn eq(&self, other: &Self) -> bool {
        self.name.eq(&other.name)
            && self.config_type.eq(&other.config_type)
            && self.default_value.eq(&other.default_value)
    }
}

impl Eq for ConfigEntry {}

impl ValidConfiguration {
    // When constructing a ValidConfiguration, necessary validation check will be done
    fn new(
        settings: HashMap<String, String>,
        valid_entries: Vec<ConfigEntry>,
    ) -> Result<Self> {
        let valid_entries = valid_entries
            .into_iter()
            .map(|e| (e.name.clone(), e))
            .collect::<HashMap<_, _>>();

        // Firstly, check whether the entries in settings are valid or not
        for (name, _) in settings.iter() {
            if !valid_entries.contains_key(name) {
                return Err(RssError::Configuration(format!(
                    "The configuration setting '{name}' is not valid"
                )));
            }
        }

        // Secondly, check that every entry either has a parseable supplied
        // value or a parseable default.
        for (name, entry) in valid_entries.iter() {
            if let Some(v) = settings.get(&entry.name) {
                Self::parse_value(v.as_str(), entry.config_type).map_err(|e| {
                    RssError::Configuration(format!(
                        "Failed to parse user-supplied value '{v}' for configuration setting '{name}': {e}"
                    ))
                })?;
            } else if let Some(v) = entry.default_value.clone() {
                Self::parse_value(v.as_str(), entry.config_type).map_err(|e| {
                    RssError::Configuration(format!(
                        "Failed to parse default value '{v}' for configuration setting '{name}': {e}"
                    ))
                })?;
            } else {
                return Err(RssError::Configuration(format!(
                    "No value specified for mandatory configuration setting '{name}'"
                )));
            }
        }

        Ok(Self {
            settings,
            valid_entries,
        })
    }

    fn raw(&self, key: &str) -> &str {
        if let Some(v) = self.settings.get(key) {
            v
        } else {
            // infallible because we validate all configs in the constructor
            self.valid_entries
                .get(key)
                .unwrap()
                .default_value
                .as_ref()
                .unwrap()
        }
    }

    pub fn get_usize_setting(&self, key: &str) -> usize {
        // infallible because we validate all configs in the constructor
        self.raw(key).parse().unwrap()
    }

    pub fn get_u64_setting(&self, key: &str) -> u64 {
        self.raw(key).parse().unwrap()
    }

    pub fn get_f64_setting(&self, key: &str) -> f64 {
        self.raw(key).parse().unwrap()
    }

    pub fn get_bool_setting(&self, key: &str) -> bool {
        self.raw(key).parse().unwrap()
    }

    pub fn get_string_setting(&self, key: &str) -> String {
        self.raw(key).to_owned()
    }

    /// Error when the value is not able to parsed to the config type
    fn parse_value(val: &str, config_type: ConfigType) -> ParseResult<()> {
        match config_type {
            ConfigType::UInt => {
                val.parse::<usize>().map_err(|e| format!("{e:?}"))?;
            }
            ConfigType::UInt64 => {
                val.parse::<u64>().map_err(|e| format!("{e:?}"))?;
            }
            ConfigType::Float => {
                val.parse::<f64>().map_err(|e| format!("{e:?}"))?;
            }
            ConfigType::Boolean => {
                val.parse::<bool>().map_err(|e| format!("{e:?}"))?;
            }
            ConfigType::Utf8 => {}
        }

        Ok(())
    }
}

/// rss configuration builder
#[derive(Default)]
pub struct RssConfigBuilder {
    settings: HashMap<String, String>,
}

impl RssConfigBuilder {
    /// Create a new configuration based on key-value pairs
    pub fn with_settings(settings: HashMap<String, String>) -> Self {
        Self { settings }
    }

    /// Create a new config with an additional setting
    pub fn set(&self, k: &str, v: &str) -> Self {
        let mut settings = self.settings.clone();
        settings.insert(k.to_owned(), v.to_owned());
        Self { settings }
    }

    pub fn build(&self) -> Result<RssConfig> {
        ValidConfiguration::new(self.settings.clone(), Self::valid_entries())
            .map(|valid_config| RssConfig { valid_config })
    }

    /// All available configuration options
    pub fn valid_entries() -> Vec<ConfigEntry> {
        vec![
            ConfigEntry::new(RSS_BLOCK_SIZE,
                             "Target packet size of a client-to-worker block",
                             ConfigType::UInt, "1048576"),
            ConfigEntry::new(RSS_MAX_REQUEST_SIZE,
                             "Hard cap on a single network payload",
                             ConfigType::UInt, "16777216"),
            ConfigEntry::new(RSS_MAX_FLYING_PACKAGE_NUM,
                             "Client-side inflight block window",
                             ConfigType::UInt, "64"),
            ConfigEntry::new(RSS_MEMORY_THRESHOLD,
                             "Client arena-writer buffer cap in bytes",
                             ConfigType::UInt, "134217728"),
            ConfigEntry::new(RSS_WRITER_BUFFER_SPILL,
                             "Sort-writer in-memory threshold in bytes before spilling a run",
                             ConfigType::UInt, "67108864"),
            ConfigEntry::new(RSS_WRITER_TYPE,
                             "Write strategy: auto, bypass, unsafe or sort",
                             ConfigType::Utf8, "auto"),
            ConfigEntry::new(RSS_BYPASS_THRESHOLD,
                             "Maximum partition count for the bypass writer",
                             ConfigType::UInt, "200"),
            ConfigEntry::new(RSS_PARTITION_COUNT_PER_SHUFFLE_WORKER,
                             "Sizing hint: partitions served per requested worker",
                             ConfigType::UInt, "500"),
            ConfigEntry::new(RSS_WORKERS_PER_GROUP,
                             "Workers per server group in the shuffle handle",
                             ConfigType::UInt, "2"),
            ConfigEntry::new(RSS_MIN_SERVER_COUNT,
                             "Lower clamp on workers allocated per shuffle",
                             ConfigType::UInt, "1"),
            ConfigEntry::new(RSS_MAX_SERVER_COUNT,
                             "Upper clamp on workers allocated per shuffle",
                             ConfigType::UInt, "64"),
            ConfigEntry::new(RSS_READ_IO_THREADS,
                             "Parallel part-file fetchers per reader",
                             ConfigType::UInt, "8"),
            ConfigEntry::new(RSS_READ_MAX_SIZE,
                             "Reader fetch-ahead bound in bytes",
                             ConfigType::UInt, "67108864"),
            ConfigEntry::new(RSS_READ_MERGE_SIZE,
                             "Target size of reader output chunks in bytes",
                             ConfigType::UInt, "4194304"),
            ConfigEntry::new(RSS_INPUT_READY_QUERY_INTERVAL,
                             "Millis between stage-marker polls",
                             ConfigType::UInt64, "500"),
            ConfigEntry::new(RSS_INPUT_READY_MAX_WAIT_TIME,
                             "Maximum millis a reader waits for the stage marker",
                             ConfigType::UInt64, "600000"),
            ConfigEntry::new(RSS_DELETE_SHUFFLE_DIR,
                             "Delete the shuffle DFS tree at stage end",
                             ConfigType::Boolean, "false"),
            ConfigEntry::new(RSS_SERVICE_MANAGER_TYPE,
                             "Allocator source: master or zk",
                             ConfigType::Utf8, "master"),
            ConfigEntry::new(RSS_NETWORK_TIMEOUT,
                             "Deadline in millis carried by every network call",
                             ConfigType::UInt64, "120000"),
            ConfigEntry::new(RSS_NETWORK_RETRIES,
                             "Bound on client retries for transient failures",
                             ConfigType::UInt, "3"),
            ConfigEntry::new(RSS_APP_STORAGE_RETENTION_MILLIS,
                             "Age after which an application's DFS tree is deleted",
                             ConfigType::UInt64, "86400000"),
            ConfigEntry::new(RSS_APP_OBJ_RETENTION_MILLIS,
                             "Age after which in-memory app/stage state is evicted",
                             ConfigType::UInt64, "3600000"),
            ConfigEntry::new(RSS_BASE_CONNECTIONS,
                             "Base connection token pool per worker",
                             ConfigType::UInt, "64"),
            ConfigEntry::new(RSS_TOTAL_CONNECTIONS,
                             "Connection tokens per worker including burst",
                             ConfigType::UInt, "256"),
            ConfigEntry::new(RSS_DUMPER_THREADS,
                             "Worker flush pool size",
                             ConfigType::UInt, "8"),
            ConfigEntry::new(RSS_DUMPER_QUEUE_SIZE,
                             "Bounded queue length per dumper",
                             ConfigType::UInt, "64"),
            ConfigEntry::new(RSS_MEMORY_CONTROL_SIZE_THRESHOLD,
                             "Resident buffered bytes a worker accepts before refusing blocks",
                             ConfigType::UInt64, "268435456"),
            ConfigEntry::new(RSS_MEMORY_CONTROL_LOW_WATER_RATIO,
                             "Fraction of the memory threshold to drain to before re-admitting",
                             ConfigType::Float, "0.75"),
            ConfigEntry::new(RSS_DUMP_BLOCK_FACTOR,
                             "Partition buffer flushes at block.size times this factor",
                             ConfigType::UInt, "8"),
            ConfigEntry::new(RSS_PARTITION_IDLE_TIMEOUT,
                             "Millis of partition inactivity before its buffer is flushed",
                             ConfigType::UInt64, "30000"),
            ConfigEntry::new(RSS_HEARTBEAT_INTERVAL,
                             "Millis between worker registry heartbeats",
                             ConfigType::UInt64, "10000"),
            ConfigEntry::new(RSS_SESSION_TIMEOUT,
                             "Registry session timeout in millis; ephemeral entries outlive their owner by at most this",
                             ConfigType::UInt64, "30000"),
            ConfigEntry::new(RSS_DATA_CENTER,
                             "Datacenter this process belongs to",
                             ConfigType::Utf8, "default"),
            ConfigEntry::new(RSS_CLUSTER,
                             "Cluster this process belongs to",
                             ConfigType::Utf8, "default"),
            ConfigEntry::new(RSS_STORAGE_ROOT,
                             "DFS directory prefix under which shuffle data is written",
                             ConfigType::Utf8, ""),
            ConfigEntry::new(RSS_DFS_SITE,
                             "Opaque DFS site configuration forwarded to clients",
                             ConfigType::Utf8, ""),
        ]
    }
}

/// rss configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RssConfig {
    /// Settings stored in map for easy serde
    valid_config: ValidConfiguration,
}

impl RssConfig {
    /// Create a configuration builder
    pub fn builder() -> RssConfigBuilder {
        RssConfigBuilder::default()
    }

    /// Create a default configuration
    pub fn new() -> Result<Self> {
        Self::with_settings(HashMap::new())
    }

    /// Create a new configuration based on key-value pairs
    pub fn with_settings(settings: HashMap<String, String>) -> Result<Self> {
        RssConfigBuilder::with_settings(settings).build()
    }

    pub fn settings(&self) -> &HashMap<String, String> {
        &self.valid_config.settings
    }

    pub fn block_size(&self) -> usize {
        self.valid_config.get_usize_setting(RSS_BLOCK_SIZE)
    }

    pub fn max_request_size(&self) -> usize {
        self.valid_config.get_usize_setting(RSS_MAX_REQUEST_SIZE)
    }

    pub fn max_flying_package_num(&self) -> usize {
        self.valid_config
            .get_usize_setting(RSS_MAX_FLYING_PACKAGE_NUM)
    }

    pub fn memory_threshold(&self) -> usize {
        self.valid_config.get_usize_setting(RSS_MEMORY_THRESHOLD)
    }

    pub fn writer_buffer_spill(&self) -> usize {
        self.valid_config.get_usize_setting(RSS_WRITER_BUFFER_SPILL)
    }

    pub fn writer_type(&self) -> String {
        self.valid_config.get_string_setting(RSS_WRITER_TYPE)
    }

    pub fn bypass_threshold(&self) -> usize {
        self.valid_config.get_usize_setting(RSS_BYPASS_THRESHOLD)
    }

    pub fn partition_count_per_shuffle_worker(&self) -> usize {
        self.valid_config
            .get_usize_setting(RSS_PARTITION_COUNT_PER_SHUFFLE_WORKER)
    }

    pub fn workers_per_group(&self) -> usize {
        self.valid_config.get_usize_setting(RSS_WORKERS_PER_GROUP)
    }

    pub fn min_server_count(&self) -> usize {
        self.valid_config.get_usize_setting(RSS_MIN_SERVER_COUNT)
    }

    pub fn max_server_count(&self) -> usize {
        self.valid_config.get_usize_setting(RSS_MAX_SERVER_COUNT)
    }

    pub fn read_io_threads(&self) -> usize {
        self.valid_config.get_usize_setting(RSS_READ_IO_THREADS)
    }

    pub fn read_max_size(&self) -> usize {
        self.valid_config.get_usize_setting(RSS_READ_MAX_SIZE)
    }

    pub fn read_merge_size(&self) -> usize {
        self.valid_config.get_usize_setting(RSS_READ_MERGE_SIZE)
    }

    pub fn input_ready_query_interval_millis(&self) -> u64 {
        self.valid_config
            .get_u64_setting(RSS_INPUT_READY_QUERY_INTERVAL)
    }

    pub fn input_ready_max_wait_millis(&self) -> u64 {
        self.valid_config
            .get_u64_setting(RSS_INPUT_READY_MAX_WAIT_TIME)
    }

    pub fn delete_shuffle_dir(&self) -> bool {
        self.valid_config.get_bool_setting(RSS_DELETE_SHUFFLE_DIR)
    }

    pub fn service_manager_type(&self) -> String {
        self.valid_config
            .get_string_setting(RSS_SERVICE_MANAGER_TYPE)
    }

    pub fn network_timeout_millis(&self) -> u64 {
        self.valid_config.get_u64_setting(RSS_NETWORK_TIMEOUT)
    }

    pub fn network_retries(&self) -> usize {
        self.valid_config.get_usize_setting(RSS_NETWORK_RETRIES)
    }

    pub fn app_storage_retention_millis(&self) -> u64 {
        self.valid_config
            .get_u64_setting(RSS_APP_STORAGE_RETENTION_MILLIS)
    }

    pub fn app_obj_retention_millis(&self) -> u64 {
        self.valid_config
            .get_u64_setting(RSS_APP_OBJ_RETENTION_MILLIS)
    }

    pub fn base_connections(&self) -> usize {
        self.valid_config.get_usize_setting(RSS_BASE_CONNECTIONS)
    }

    pub fn total_connections(&self) -> usize {
        self.valid_config.get_usize_setting(RSS_TOTAL_CONNECTIONS)
    }

    pub fn dumper_threads(&self) -> usize {
        self.valid_config.get_usize_setting(RSS_DUMPER_THREADS)
    }

    pub fn dumper_queue_size(&self) -> usize {
        self.valid_config.get_usize_setting(RSS_DUMPER_QUEUE_SIZE)
    }

    pub fn memory_control_size_threshold(&self) -> u64 {
        self.valid_config
            .get_u64_setting(RSS_MEMORY_CONTROL_SIZE_THRESHOLD)
    }

    pub fn memory_control_low_water_ratio(&self) -> f64 {
        self.valid_config
            .get_f64_setting(RSS_MEMORY_CONTROL_LOW_WATER_RATIO)
    }

    pub fn dump_block_factor(&self) -> usize {
        self.valid_config.get_usize_setting(RSS_DUMP_BLOCK_FACTOR)
    }

    pub fn partition_idle_timeout_millis(&self) -> u64 {
        self.valid_config
            .get_u64_setting(RSS_PARTITION_IDLE_TIMEOUT)
    }

    pub fn heartbeat_interval_millis(&self) -> u64 {
        self.valid_config.get_u64_setting(RSS_HEARTBEAT_INTERVAL)
    }

    pub fn session_timeout_millis(&self) -> u64 {
        self.valid_config.get_u64_setting(RSS_SESSION_TIMEOUT)
    }

    pub fn data_center(&self) -> String {
        self.valid_config.get_string_setting(RSS_DATA_CENTER)
    }

    pub fn cluster(&self) -> String {
        self.valid_config.get_string_setting(RSS_CLUSTER)
    }

    pub fn storage_root(&self) -> String {
        self.valid_config.get_string_setting(RSS_STORAGE_ROOT)
    }

    pub fn dfs_site(&self) -> String {
        self.valid_config.get_string_setting(RSS_DFS_SITE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() -> Result<()> {
        let config = RssConfig::new()?;
        assert_eq!(1048576, config.block_size());
        assert_eq!(64, config.max_flying_package_num());
        assert_eq!("auto", config.writer_type().as_str());
        assert_eq!("master", config.service_manager_type().as_str());
        assert!(!config.delete_shuffle_dir());
        assert!((config.memory_control_low_water_ratio() - 0.75).abs() < f64::EPSILON);
        Ok(())
    }

    #[test]
    fn custom_config() -> Result<()> {
        let config = RssConfig::builder()
            .set(RSS_BLOCK_SIZE, "4096")
            .set(RSS_DELETE_SHUFFLE_DIR, "true")
            .set(RSS_WRITER_TYPE, "sort")
            .build()?;
        assert_eq!(4096, config.block_size());
        assert!(config.delete_shuffle_dir());
        assert_eq!("sort", config.writer_type().as_str());
        Ok(())
    }

    #[test]
    fn custom_config_invalid() {
        let config = RssConfig::builder().set(RSS_BLOCK_SIZE, "not-a-number").build();
        assert!(matches!(config, Err(RssError::Configuration(_))));

        let config = RssConfig::builder().set("rss.no.such.option", "1").build();
        assert!(matches!(config, Err(RssError::Configuration(_))));

        let config = RssConfig::builder().set(RSS_DELETE_SHUFFLE_DIR, "123").build();
        assert!(matches!(config, Err(RssError::Configuration(_))));
    }
}
