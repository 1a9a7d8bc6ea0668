use pretty_assertions::assert_eq;
use std::io::Write;
use std::time::Duration;
use tempfile::{NamedTempFile, TempDir};

use station_aggregator::models::{AggregateRecord, StationMetadata};
use station_aggregator::pipeline::{MemoryTopics, Pipeline, PipelineStats};
use station_aggregator::readers::{ReadingReader, StationReader};
use station_aggregator::transport::partition_for;
use station_aggregator::PipelineConfig;

const RUN_TIMEOUT: Duration = Duration::from_secs(10);

fn test_config(partitions: usize, state_dir: Option<&TempDir>) -> PipelineConfig {
    PipelineConfig::default()
        .with_partitions(partitions)
        .with_state_dir(state_dir.map(|dir| dir.path().to_path_buf()))
        .with_poll_wait(Duration::from_millis(5))
        .with_retry(3, Duration::from_millis(1))
}

async fn wait_drained(topics: &MemoryTopics, group: &str) {
    while !topics.drained(group) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Run the pipeline until everything already sent has been committed.
async fn run_until_drained(pipeline: &Pipeline, topics: &MemoryTopics) -> PipelineStats {
    let group = pipeline.config().group_id.clone();
    let shutdown = pipeline.shutdown_handle();

    let stopper = async {
        wait_drained(topics, &group).await;
        shutdown.shutdown();
    };

    let (stats, ()) = tokio::time::timeout(RUN_TIMEOUT, async {
        tokio::join!(pipeline.run(topics.pipeline_topics()), stopper)
    })
    .await
    .expect("pipeline did not drain in time");

    stats.expect("pipeline run failed")
}

fn emitted_for(topics: &MemoryTopics, station_id: u32) -> Vec<AggregateRecord> {
    topics
        .output
        .records()
        .into_iter()
        .filter(|record| record.key == station_id)
        .map(|record| record.value)
        .collect()
}

#[tokio::test]
async fn test_registered_station_aggregates_with_name() {
    let pipeline = Pipeline::open(test_config(2, None)).unwrap();
    let topics = MemoryTopics::new(2);

    topics
        .register_station(StationMetadata::new(1, "Station 1"))
        .unwrap();
    topics.send_reading(1, "2024-03-01T12:00:00Z;15").unwrap();
    topics.send_reading(1, "2024-03-01T12:05:00Z;25").unwrap();

    let stats = run_until_drained(&pipeline, &topics).await;
    assert_eq!(stats.readings_aggregated, 2);
    assert_eq!(stats.records_emitted, 2);

    let emitted = emitted_for(&topics, 1);
    assert_eq!(emitted.len(), 2);
    assert_eq!(emitted[0].count, 1);
    assert_eq!(emitted[0].average, 15.0);

    let latest = &emitted[1];
    assert_eq!(latest.count, 2);
    assert_eq!(latest.sum, 40.0);
    assert_eq!(latest.average, 20.0);
    assert_eq!(latest.station_name.as_deref(), Some("Station 1"));

    let json = serde_json::to_value(latest).unwrap();
    assert_eq!(json["stationId"], 1);
    assert_eq!(json["stationName"], "Station 1");
    assert_eq!(json["avg"], 20.0);

    assert_eq!(pipeline.query(1), Some(latest.clone()));
}

#[tokio::test]
async fn test_unregistered_station_still_aggregates() {
    let pipeline = Pipeline::open(test_config(2, None)).unwrap();
    let topics = MemoryTopics::new(2);

    topics.send_reading(2, "2024-03-01T12:00:00Z;7.5").unwrap();
    run_until_drained(&pipeline, &topics).await;

    let emitted = emitted_for(&topics, 2);
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].count, 1);
    assert_eq!(emitted[0].average, 7.5);
    assert_eq!(emitted[0].station_name, None);
}

#[tokio::test]
async fn test_malformed_reading_is_skipped() {
    let pipeline = Pipeline::open(test_config(1, None)).unwrap();
    let topics = MemoryTopics::new(1);

    topics.send_reading(3, "garbage").unwrap();
    topics.send_reading(3, "2024-03-01T12:00:00Z;not-a-number").unwrap();
    topics.send_reading(3, "2024-03-01T12:00:00Z;4").unwrap();

    let stats = run_until_drained(&pipeline, &topics).await;
    assert_eq!(stats.decode_errors, 2);
    assert_eq!(stats.readings_aggregated, 1);

    let emitted = emitted_for(&topics, 3);
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].count, 1);
    assert_eq!(emitted[0].average, 4.0);
}

#[tokio::test]
async fn test_late_registration_applies_to_later_readings_only() {
    let pipeline = Pipeline::open(test_config(2, None)).unwrap();
    let topics = MemoryTopics::new(2);
    let group = pipeline.config().group_id.clone();
    let shutdown = pipeline.shutdown_handle();

    topics.send_reading(4, "2024-03-01T12:00:00Z;10").unwrap();

    let driver = async {
        wait_drained(&topics, &group).await;
        topics
            .register_station(StationMetadata::new(4, "Late Station"))
            .unwrap();
        topics.send_reading(4, "2024-03-01T12:10:00Z;20").unwrap();
        wait_drained(&topics, &group).await;
        shutdown.shutdown();
    };

    let (stats, ()) = tokio::time::timeout(RUN_TIMEOUT, async {
        tokio::join!(pipeline.run(topics.pipeline_topics()), driver)
    })
    .await
    .expect("pipeline did not drain in time");
    stats.unwrap();

    let emitted = emitted_for(&topics, 4);
    assert_eq!(emitted.len(), 2);
    assert_eq!(emitted[0].station_name, None);
    assert_eq!(emitted[0].count, 1);
    assert_eq!(emitted[1].station_name.as_deref(), Some("Late Station"));
    assert_eq!(emitted[1].count, 2);
    assert_eq!(emitted[1].average, 15.0);
}

#[tokio::test]
async fn test_many_stations_across_partitions() {
    let partitions = 4;
    let pipeline = Pipeline::open(test_config(partitions, None)).unwrap();
    let topics = MemoryTopics::new(partitions);

    let stations = 1..=12u32;
    let readings_per_station = 25u64;

    for id in stations.clone() {
        topics
            .register_station(StationMetadata::new(id, format!("Station {}", id)))
            .unwrap();
    }
    for n in 0..readings_per_station {
        for id in stations.clone() {
            topics
                .send_reading(id, format!("2024-03-01T12:{:02}:00Z;{}", n % 60, n))
                .unwrap();
        }
    }

    let stats = run_until_drained(&pipeline, &topics).await;
    assert_eq!(stats.workers, partitions);
    assert_eq!(stats.readings_aggregated, 12 * readings_per_station);

    let expected_sum = (0..readings_per_station).sum::<u64>() as f64;
    for id in stations {
        let record = pipeline.query(id).unwrap();
        assert_eq!(record.count, readings_per_station);
        assert_eq!(record.sum, expected_sum);
        assert_eq!(record.min, 0.0);
        assert_eq!(record.max, (readings_per_station - 1) as f64);

        // Every aggregate lands on its station's partition, in update order.
        let on_partition: Vec<u64> = topics
            .output
            .partition_records(partition_for(id, partitions))
            .into_iter()
            .filter(|r| r.key == id)
            .map(|r| r.value.count)
            .collect();
        assert_eq!(on_partition, (1..=readings_per_station).collect::<Vec<_>>());
    }

    assert_eq!(pipeline.state_store().len(), 12);
}

#[tokio::test]
async fn test_restart_resumes_from_changelog() {
    let state_dir = TempDir::new().unwrap();

    {
        let pipeline = Pipeline::open(test_config(2, Some(&state_dir))).unwrap();
        let topics = MemoryTopics::new(2);
        topics
            .register_station(StationMetadata::new(5, "Durable"))
            .unwrap();
        topics.send_reading(5, "2024-03-01T12:00:00Z;1").unwrap();
        topics.send_reading(5, "2024-03-01T12:01:00Z;3").unwrap();
        run_until_drained(&pipeline, &topics).await;
    }

    let pipeline = Pipeline::open(test_config(2, Some(&state_dir))).unwrap();
    assert_eq!(pipeline.query(5).map(|r| r.count), Some(2));
    assert_eq!(
        pipeline.station(5),
        Some(StationMetadata::new(5, "Durable"))
    );

    let topics = MemoryTopics::new(2);
    topics.send_reading(5, "2024-03-01T12:02:00Z;5").unwrap();
    run_until_drained(&pipeline, &topics).await;

    let record = pipeline.query(5).unwrap();
    assert_eq!(record.count, 3);
    assert_eq!(record.average, 3.0);
    assert_eq!(record.station_name.as_deref(), Some("Durable"));
}

#[tokio::test]
async fn test_replay_from_csv_files() {
    let mut stations_csv = NamedTempFile::new().unwrap();
    writeln!(stations_csv, "station_id,name").unwrap();
    writeln!(stations_csv, "10,Alpha").unwrap();
    writeln!(stations_csv, "11,Beta").unwrap();

    let mut readings_csv = NamedTempFile::new().unwrap();
    writeln!(readings_csv, "station_id,payload").unwrap();
    writeln!(readings_csv, "10,2024-03-01T12:00:00Z;2").unwrap();
    writeln!(readings_csv, "11,2024-03-01T12:00:00Z;8").unwrap();
    writeln!(readings_csv, "10,2024-03-01T12:01:00Z;4").unwrap();

    let pipeline = Pipeline::open(test_config(3, None)).unwrap();
    let topics = MemoryTopics::new(3);

    for station in StationReader::new().read_stations(stations_csv.path()).unwrap() {
        topics.register_station(station).unwrap();
    }
    for (station_id, payload) in ReadingReader::new()
        .read_readings(readings_csv.path())
        .unwrap()
    {
        topics.send_reading(station_id, payload).unwrap();
    }

    run_until_drained(&pipeline, &topics).await;

    let snapshot = pipeline.state_store().snapshot();
    let summary: Vec<(u32, Option<String>, u64, f64)> = snapshot
        .into_iter()
        .map(|r| (r.station_id, r.station_name, r.count, r.average))
        .collect();
    assert_eq!(
        summary,
        vec![
            (10, Some("Alpha".to_string()), 2, 3.0),
            (11, Some("Beta".to_string()), 1, 8.0),
        ]
    );
}
