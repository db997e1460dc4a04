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

//! End-to-end write -> finalize -> read round trips across all three write
//! strategies.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::{TestCluster, collect_records, test_config};
use rss_client::writer::{ShuffleDependency, WriterKind};
use rss_client::ShuffleService;
use rss_core::config::{self, RssConfig, RssConfigBuilder};
use rss_core::ids::StageShuffleId;

const NUM_PARTITIONS: u32 = 4;
const NUM_MAPPERS: u32 = 3;
const RECORDS_PER_MAPPER: u32 = 1000;

fn record(map_id: u32, index: u32) -> Vec<u8> {
    format!("map-{map_id}/record-{index}").into_bytes()
}

fn dependency() -> ShuffleDependency {
    ShuffleDependency {
        num_partitions: NUM_PARTITIONS,
        map_side_combine: false,
        serializer_relocatable: true,
    }
}

fn config_for(kind: WriterKind) -> RssConfig {
    let writer_type = match kind {
        WriterKind::Bypass => "bypass",
        WriterKind::Arena => "unsafe",
        WriterKind::Sort => "sort",
    };
    // A tiny spill threshold makes the sort writer exercise its run files.
    RssConfigBuilder::with_settings(test_config().settings().clone())
        .set(config::RSS_WRITER_TYPE, writer_type)
        .set(config::RSS_WRITER_BUFFER_SPILL, "8192")
        .build()
        .unwrap()
}

async fn run_round_trip(kind: WriterKind) {
    let cluster = TestCluster::start(2, config_for(kind)).await;
    let manager = cluster.manager();

    let stage = StageShuffleId::new("app-roundtrip", "1", 0, 0);
    let handle = Arc::new(
        manager
            .register_shuffle(stage.clone(), NUM_PARTITIONS)
            .await
            .unwrap(),
    );

    for map_id in 0..NUM_MAPPERS {
        let mut writer = manager
            .get_writer(&handle, map_id, 0, &dependency())
            .unwrap();
        assert_eq!(writer.kind(), kind);
        for index in 0..RECORDS_PER_MAPPER {
            let partition = index % NUM_PARTITIONS;
            writer.write(partition, &record(map_id, index)).await.unwrap();
        }
        let stats = writer.close().await.unwrap();
        assert_eq!(stats.records, RECORDS_PER_MAPPER as u64);
        assert!(stats.blocks > 0);
    }

    manager.finalizer(handle.clone()).commit().await.unwrap();

    let reader = manager.get_reader(&handle).unwrap();
    let records = collect_records(reader.open(0..NUM_PARTITIONS, 0..NUM_MAPPERS))
        .await
        .unwrap();
    assert_eq!(
        records.len(),
        (NUM_MAPPERS * RECORDS_PER_MAPPER) as usize,
        "{kind:?} round trip lost or duplicated records"
    );

    // Exact multiset equality with what the mappers produced.
    let mut counts: HashMap<Vec<u8>, i64> = HashMap::new();
    for map_id in 0..NUM_MAPPERS {
        for index in 0..RECORDS_PER_MAPPER {
            *counts.entry(record(map_id, index)).or_default() += 1;
        }
    }
    for got in &records {
        *counts.entry(got.to_vec()).or_default() -= 1;
    }
    assert!(
        counts.values().all(|c| *c == 0),
        "{kind:?} round trip produced a different record multiset"
    );

    cluster.stop().await;
}

#[tokio::test]
async fn bypass_round_trip() {
    run_round_trip(WriterKind::Bypass).await;
}

#[tokio::test]
async fn arena_round_trip() {
    run_round_trip(WriterKind::Arena).await;
}

#[tokio::test]
async fn sort_round_trip() {
    run_round_trip(WriterKind::Sort).await;
}

#[tokio::test]
async fn records_preserve_map_attempt_order_within_a_partition() {
    let cluster = TestCluster::start(2, config_for(WriterKind::Bypass)).await;
    let manager = cluster.manager();

    let stage = StageShuffleId::new("app-order", "1", 0, 1);
    let handle = Arc::new(
        manager.register_shuffle(stage, NUM_PARTITIONS).await.unwrap(),
    );

    let mut writer = manager.get_writer(&handle, 0, 0, &dependency()).unwrap();
    for index in 0..RECORDS_PER_MAPPER {
        writer
            .write(index % NUM_PARTITIONS, &record(0, index))
            .await
            .unwrap();
    }
    writer.close().await.unwrap();
    manager.finalizer(handle.clone()).commit().await.unwrap();

    // Within one partition, the single mapper's records must come back in
    // production order.
    for partition in 0..NUM_PARTITIONS {
        let reader = manager.get_reader(&handle).unwrap();
        let records =
            collect_records(reader.open(partition..partition + 1, 0..1))
                .await
                .unwrap();
        let expected: Vec<Vec<u8>> = (0..RECORDS_PER_MAPPER)
            .filter(|i| i % NUM_PARTITIONS == partition)
            .map(|i| record(0, i))
            .collect();
        let got: Vec<Vec<u8>> = records.iter().map(|r| r.to_vec()).collect();
        assert_eq!(got, expected, "partition {partition} order broken");
    }

    cluster.stop().await;
}

#[tokio::test]
async fn partition_ranges_select_their_slice() {
    let cluster = TestCluster::start(2, config_for(WriterKind::Bypass)).await;
    let manager = cluster.manager();

    let stage = StageShuffleId::new("app-range", "1", 0, 2);
    let handle = Arc::new(
        manager.register_shuffle(stage, NUM_PARTITIONS).await.unwrap(),
    );

    let mut writer = manager.get_writer(&handle, 0, 0, &dependency()).unwrap();
    for index in 0..400 {
        writer.write(index % NUM_PARTITIONS, &record(0, index)).await.unwrap();
    }
    writer.close().await.unwrap();
    manager.finalizer(handle.clone()).commit().await.unwrap();

    let reader = manager.get_reader(&handle).unwrap();
    let records = collect_records(reader.open(1..3, 0..1)).await.unwrap();
    // Partitions 1 and 2 hold exactly half of the 400 records.
    assert_eq!(records.len(), 200);
    for r in &records {
        let text = String::from_utf8(r.to_vec()).unwrap();
        let index: u32 = text.rsplit('-').next().unwrap().parse().unwrap();
        assert!(index % NUM_PARTITIONS == 1 || index % NUM_PARTITIONS == 2);
    }

    cluster.stop().await;
}
