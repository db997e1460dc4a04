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

//! Failure-path and lifecycle scenarios over the in-process cluster.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{TestCluster, collect_records, test_config, wait_for_leader};
use rss_client::ShuffleService;
use rss_client::connection::{ConnectOptions, WorkerConnection};
use rss_client::writer::ShuffleDependency;
use rss_core::config::{self, RssConfigBuilder};
use rss_core::error::RssError;
use rss_core::ids::StageShuffleId;
use rss_core::protocol::SendBlockRequest;
use rss_core::registry::Registry;
use rss_master::process::{MasterProcessConfig, start_master_process};

fn dependency(num_partitions: u32) -> ShuffleDependency {
    ShuffleDependency {
        num_partitions,
        map_side_combine: false,
        serializer_relocatable: false,
    }
}

fn record_payload(text: &str) -> Bytes {
    let mut buf = bytes::BytesMut::new();
    rss_core::block::put_record(&mut buf, text.as_bytes());
    buf.freeze()
}

#[tokio::test]
async fn duplicate_blocks_are_acked_once_and_stored_once() {
    let cluster = TestCluster::start(1, test_config()).await;
    let manager = cluster.manager();

    let stage = StageShuffleId::new("app-dup", "1", 0, 0);
    let handle = Arc::new(manager.register_shuffle(stage.clone(), 1).await.unwrap());

    let worker = handle.worker_for_partition(0).clone();
    let opts = ConnectOptions::from_config(&cluster.config);
    let mut connection = WorkerConnection::connect(&worker, "app-dup", "1", &opts)
        .await
        .unwrap();

    let block = SendBlockRequest {
        stage: stage.clone(),
        partition_id: 0,
        num_partitions: 1,
        map_id: 7,
        map_attempt: 0,
        seq_no: 3,
        terminator: false,
        payload: record_payload("the one record"),
    };
    // First delivery is fresh, the redelivery acks as a duplicate.
    assert!(!connection.send_block(&block).await.unwrap());
    assert!(connection.send_block(&block).await.unwrap());

    // Earlier seqs of the same attempt, then the terminator.
    for seq in 0..3 {
        let earlier = SendBlockRequest {
            seq_no: seq,
            payload: record_payload(&format!("record {seq}")),
            ..block.clone()
        };
        assert!(!connection.send_block(&earlier).await.unwrap());
    }
    let terminator = SendBlockRequest {
        seq_no: 4,
        terminator: true,
        payload: Bytes::new(),
        ..block.clone()
    };
    assert!(!connection.send_block(&terminator).await.unwrap());

    manager.finalizer(handle.clone()).commit().await.unwrap();

    let reader = manager.get_reader(&handle).unwrap();
    let records = collect_records(reader.open(0..1, 0..8)).await.unwrap();
    assert_eq!(records.len(), 4, "the duplicated block must appear once");

    cluster.stop().await;
}

#[tokio::test]
async fn reader_waits_for_the_stage_marker() {
    let cluster = TestCluster::start(1, test_config()).await;
    let manager = cluster.manager();

    let stage = StageShuffleId::new("app-wait", "1", 0, 0);
    let handle = Arc::new(manager.register_shuffle(stage, 2).await.unwrap());

    // Start the reader before anything is written or finalized.
    let reader = manager.get_reader(&handle).unwrap();
    let pending = tokio::spawn(collect_records(reader.open(0..2, 0..1)));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!pending.is_finished(), "reader must poll, not fail eagerly");

    let mut writer = manager.get_writer(&handle, 0, 0, &dependency(2)).unwrap();
    for i in 0..100u32 {
        writer.write(i % 2, format!("r{i}").as_bytes()).await.unwrap();
    }
    writer.close().await.unwrap();
    manager.finalizer(handle.clone()).commit().await.unwrap();

    let records = pending.await.unwrap().unwrap();
    assert_eq!(records.len(), 100);

    cluster.stop().await;
}

#[tokio::test]
async fn reader_times_out_without_a_marker() {
    let config = RssConfigBuilder::with_settings(test_config().settings().clone())
        .set(config::RSS_INPUT_READY_MAX_WAIT_TIME, "300")
        .build()
        .unwrap();
    let cluster = TestCluster::start(1, config).await;
    let manager = cluster.manager();

    let stage = StageShuffleId::new("app-timeout", "1", 0, 0);
    let handle = Arc::new(manager.register_shuffle(stage, 1).await.unwrap());

    let reader = manager.get_reader(&handle).unwrap();
    let err = collect_records(reader.open(0..1, 0..1)).await.unwrap_err();
    assert!(matches!(err, RssError::InputNotReady(_)));

    cluster.stop().await;
}

#[tokio::test]
async fn writes_survive_worker_memory_pressure() {
    // A worker with a 16 KiB resident budget against ~200 KiB of writes:
    // progress only happens because dumpers drain and clients retry the
    // transient refusals.
    let config = RssConfigBuilder::with_settings(test_config().settings().clone())
        .set(config::RSS_MEMORY_CONTROL_SIZE_THRESHOLD, "16384")
        .set(config::RSS_BLOCK_SIZE, "1024")
        .set(config::RSS_NETWORK_RETRIES, "10")
        .build()
        .unwrap();
    let cluster = TestCluster::start(1, config).await;
    let manager = cluster.manager();

    let stage = StageShuffleId::new("app-pressure", "1", 0, 0);
    let handle = Arc::new(manager.register_shuffle(stage, 4).await.unwrap());

    let payload = "x".repeat(100);
    for map_id in 0..3u32 {
        let mut writer = manager
            .get_writer(&handle, map_id, 0, &dependency(4))
            .unwrap();
        for i in 0..700u32 {
            writer
                .write(i % 4, format!("{map_id}:{i}:{payload}").as_bytes())
                .await
                .unwrap();
        }
        writer.close().await.unwrap();
    }

    manager.finalizer(handle.clone()).commit().await.unwrap();

    let reader = manager.get_reader(&handle).unwrap();
    let records = collect_records(reader.open(0..4, 0..3)).await.unwrap();
    assert_eq!(records.len(), 3 * 700, "no record may be lost to backpressure");

    cluster.stop().await;
}

#[tokio::test]
async fn a_new_stage_attempt_supersedes_the_failed_one() {
    let cluster = TestCluster::start(2, test_config()).await;
    let manager = cluster.manager();

    // Attempt 0 writes partial output and never finalizes (its stage died).
    let attempt0 = StageShuffleId::new("app-retry", "1", 0, 0);
    let handle0 = Arc::new(manager.register_shuffle(attempt0, 2).await.unwrap());
    let mut writer = manager.get_writer(&handle0, 0, 0, &dependency(2)).unwrap();
    for i in 0..50u32 {
        writer.write(i % 2, format!("stale-{i}").as_bytes()).await.unwrap();
    }
    writer.close().await.unwrap();

    // The driver retries the stage: new attempt, fresh registration.
    let attempt1 = StageShuffleId::new("app-retry", "1", 1, 0);
    let handle1 = Arc::new(manager.register_shuffle(attempt1, 2).await.unwrap());
    let finalizer = manager.finalizer(handle1.clone());
    finalizer.prepare_rerun().await.unwrap();

    let mut writer = manager.get_writer(&handle1, 0, 0, &dependency(2)).unwrap();
    for i in 0..80u32 {
        writer.write(i % 2, format!("fresh-{i}").as_bytes()).await.unwrap();
    }
    writer.close().await.unwrap();
    finalizer.commit().await.unwrap();

    // The reader of the new attempt sees only attempt-1 data.
    let reader = manager.get_reader(&handle1).unwrap();
    let records = collect_records(reader.open(0..2, 0..1)).await.unwrap();
    assert_eq!(records.len(), 80);
    for r in &records {
        assert!(r.starts_with(b"fresh-"), "stale attempt data leaked");
    }

    cluster.stop().await;
}

#[tokio::test]
async fn allocation_survives_master_failover() {
    let cluster = TestCluster::start(2, test_config()).await;
    let manager = cluster.manager();

    // Populate the manager's cached master address.
    let stage = StageShuffleId::new("app-failover", "1", 0, 0);
    manager.register_shuffle(stage, 2).await.unwrap();

    // Kill the active master and elect a replacement.
    let mut cluster = cluster;
    cluster.master.take().unwrap().stop().await;
    let replacement = start_master_process(
        MasterProcessConfig::standalone(cluster.config.clone()),
        cluster.registry.clone() as Arc<dyn Registry>,
    )
    .await
    .unwrap();
    wait_for_leader(&cluster.registry, &cluster.config).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The same manager re-resolves the leader through the registry; no
    // client-side reconfiguration is needed.
    let stage = StageShuffleId::new("app-failover", "1", 0, 1);
    let handle = manager.register_shuffle(stage, 2).await.unwrap();
    assert!(!handle.groups.is_empty());

    replacement.stop().await;
    cluster.stop().await;
}

#[tokio::test]
async fn registry_direct_allocation_needs_no_master() {
    let config = RssConfigBuilder::with_settings(test_config().settings().clone())
        .set(config::RSS_SERVICE_MANAGER_TYPE, "zk")
        .build()
        .unwrap();
    let mut cluster = TestCluster::start(2, config).await;

    // Take the master away entirely; zk mode allocates from the registry.
    cluster.master.take().unwrap().stop().await;

    let manager = cluster.manager();
    let stage = StageShuffleId::new("app-zk", "1", 0, 0);
    let handle = Arc::new(manager.register_shuffle(stage, 4).await.unwrap());

    let mut writer = manager.get_writer(&handle, 0, 0, &dependency(4)).unwrap();
    for i in 0..200u32 {
        writer.write(i % 4, format!("zk-{i}").as_bytes()).await.unwrap();
    }
    writer.close().await.unwrap();
    manager.finalizer(handle.clone()).commit().await.unwrap();

    let reader = manager.get_reader(&handle).unwrap();
    let records = collect_records(reader.open(0..4, 0..1)).await.unwrap();
    assert_eq!(records.len(), 200);

    cluster.stop().await;
}

#[tokio::test]
async fn no_live_workers_is_a_synchronous_registration_error() {
    let cluster = TestCluster::start(0, test_config()).await;
    let manager = cluster.manager();

    let stage = StageShuffleId::new("app-none", "1", 0, 0);
    let err = manager.register_shuffle(stage, 2).await.unwrap_err();
    assert!(matches!(err, RssError::NoShuffleWorkers(_)));

    cluster.stop().await;
}
