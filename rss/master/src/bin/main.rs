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

//! rss master binary.

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use tracing_subscriber::EnvFilter;

use rss_core::config::RssConfig;
use rss_core::error::{Result, RssError};
use rss_core::registry::{EtcdRegistry, Registry};
use rss_master::process::{MasterProcessConfig, start_master_process};

#[derive(Parser)]
#[command(name = "rss-master", about = "rss shuffle master daemon")]
struct Config {
    /// Local address to bind the control endpoint on.
    #[arg(long, default_value = "0.0.0.0")]
    bind_host: String,

    /// Hostname advertised in the registry.
    #[arg(long)]
    external_host: Option<String>,

    /// Control endpoint port.
    #[arg(long, default_value_t = 20000)]
    port: u16,

    /// Coordination service endpoints.
    #[arg(long = "etcd-endpoint", default_values_t = [String::from("http://localhost:2379")])]
    etcd_endpoints: Vec<String>,

    /// Extra `rss.*` configuration overrides, `key=value`.
    #[arg(long = "conf", value_name = "KEY=VALUE")]
    conf: Vec<String>,

    /// Log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_overrides(pairs: &[String]) -> Result<HashMap<String, String>> {
    let mut settings = HashMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(RssError::Configuration(format!(
                "malformed --conf entry '{pair}', expected key=value"
            )));
        };
        settings.insert(key.to_owned(), value.to_owned());
    }
    Ok(settings)
}

async fn run(opt: Config) -> Result<()> {
    let config = RssConfig::with_settings(parse_overrides(&opt.conf)?)?;

    let registry: Arc<dyn Registry> = Arc::new(
        EtcdRegistry::connect(
            opt.etcd_endpoints.clone(),
            (config.session_timeout_millis() / 1000) as i64,
        )
        .await?,
    );

    let process_config = MasterProcessConfig {
        bind_host: opt.bind_host,
        external_host: opt.external_host,
        port: opt.port,
        config,
    };
    let handle = start_master_process(process_config, registry).await?;

    tokio::signal::ctrl_c().await.map_err(RssError::IoError)?;
    info!("Received Ctrl-C");
    handle.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    let opt = Config::parse();

    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV);
    let log_filter = EnvFilter::new(rust_log.unwrap_or_else(|_| opt.log_level.clone()));
    tracing_subscriber::fmt()
        .with_ansi(false)
        .with_env_filter(log_filter)
        .init();

    if let Err(e) = run(opt).await {
        error!("Master failed: {e}");
        std::process::exit(e.exit_code());
    }
}
