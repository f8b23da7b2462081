use chrono::{Duration, Utc};
use monitor::alerts::AlertStats;
use monitor::batching::Pipeline;
use monitor::model::{AlertSeverity, AlertStatus, Device, Sensor, SensorSample};
use monitor::notify::LogNotifier;
use monitor::registry::Registry;
use monitor::store::{MemoryStore, SampleStore};
use monitor::{Config, Error, Monitor};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

fn device(id: &str, name: &str) -> Device {
    Device {
        id: id.to_string(),
        name: name.to_string(),
        ..Device::default()
    }
}

fn sensor(id: &str, threshold: f64) -> Sensor {
    Sensor {
        id: id.to_string(),
        device_id: String::new(),
        name: "temperature".to_string(),
        sensor_type: "temperature".to_string(),
        unit: "°C".to_string(),
        min_value: 0.0,
        max_value: 200.0,
        threshold,
        last_value: 0.0,
        last_updated: None,
        enabled: true,
    }
}

async fn stored(store: &MemoryStore) -> Vec<SensorSample> {
    let now = Utc::now();
    store
        .query("", "", now - Duration::hours(1), now + Duration::hours(1), 0)
        .await
        .unwrap()
}

async fn wait_for_alerts(monitor: &Monitor, expected: usize) -> AlertStats {
    let deadline = Instant::now() + std::time::Duration::from_secs(2);
    loop {
        let stats = monitor.alerts.alert_stats();
        if stats.total >= expected || Instant::now() > deadline {
            return stats;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_flushes_forward_each_sample_once() {
    let config = Config {
        batch_size: 7,
        flush_interval_ms: 2,
        ..Config::default()
    };
    let registry = Arc::new(Registry::new(&config));
    registry.register_device(device("D1", "press")).unwrap();
    registry.add_sensor("D1", sensor("S1", 1_000.0)).unwrap();

    let store = Arc::new(MemoryStore::new());
    let pipeline = Arc::new(Pipeline::new(&config, registry, store.clone()));
    pipeline.start().unwrap();

    let mut producers = Vec::new();
    for worker in 0..8 {
        let pipeline = Arc::clone(&pipeline);
        producers.push(tokio::spawn(async move {
            for i in 0..50 {
                let value = (worker * 50 + i) as f64 / 10.0;
                pipeline
                    .process_sensor_data(SensorSample::new("D1", "S1", value))
                    .await
                    .unwrap();
                if i % 9 == 0 {
                    pipeline.flush().await;
                }
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }
    pipeline.stop().await.unwrap();

    let samples = stored(&store).await;
    assert_eq!(samples.len(), 400);
    let ids: HashSet<_> = samples.iter().map(|s| s.id.clone()).collect();
    assert_eq!(ids.len(), 400);
    assert_eq!(pipeline.processing_stats().buffered, 0);
}

#[tokio::test]
async fn test_threshold_breach_raises_one_alert() {
    let config = Config {
        batch_size: 1,
        ..Config::default()
    };
    let store = Arc::new(MemoryStore::new());
    let monitor = Monitor::with_notifier(&config, store.clone(), Arc::new(LogNotifier)).unwrap();
    monitor.registry.register_device(device("D1", "Injection Machine A")).unwrap();
    monitor.registry.add_sensor("D1", sensor("S1", 150.0)).unwrap();
    monitor.start().await.unwrap();

    monitor
        .pipeline
        .process_sensor_data(SensorSample::new("D1", "S1", 120.0))
        .await
        .unwrap();
    monitor
        .pipeline
        .process_sensor_data(SensorSample::new("D1", "S1", 160.0))
        .await
        .unwrap();

    let stats = wait_for_alerts(&monitor, 1).await;
    assert_eq!(stats.total, 1);
    let alert = &monitor.alerts.active_alerts()[0];
    assert_eq!(alert.status, AlertStatus::Active);
    assert_eq!(alert.severity, AlertSeverity::Warning);
    assert_eq!((alert.device_id.as_str(), alert.sensor_id.as_str()), ("D1", "S1"));

    let resolved = monitor.alerts.resolve_alert(&alert.id).unwrap();
    assert!(resolved.resolved_at.is_some());
    assert!(matches!(
        monitor.alerts.resolve_alert(&alert.id),
        Err(Error::State(_))
    ));

    assert_eq!(monitor.registry.get_sensor("D1", "S1").unwrap().last_value, 160.0);
    monitor.shutdown().await.unwrap();
    assert_eq!(stored(&store).await.len(), 2);
}

#[tokio::test]
async fn test_shutdown_drains_buffer() {
    let store = Arc::new(MemoryStore::new());
    let monitor = Monitor::with_notifier(&Config::default(), store.clone(), Arc::new(LogNotifier)).unwrap();
    monitor.registry.register_device(device("D1", "press")).unwrap();
    monitor.registry.add_sensor("D1", sensor("S1", 150.0)).unwrap();
    monitor.start().await.unwrap();
    assert!(matches!(monitor.start().await, Err(Error::State(_))));

    for value in [10.0, 20.0, 30.0] {
        monitor
            .pipeline
            .process_sensor_data(SensorSample::new("D1", "S1", value))
            .await
            .unwrap();
    }
    // an unknown sensor is dropped at flush time, not at submission
    monitor
        .pipeline
        .process_sensor_data(SensorSample::new("D1", "S9", 1.0))
        .await
        .unwrap();

    let report = monitor.shutdown().await.unwrap();
    assert_eq!(report.drained, 4);
    assert_eq!(report.dropped, 1);
    assert_eq!(report.forwarded, 3);
    assert!(report.stored);
    assert_eq!(store.len(), 3);
    assert!(!monitor.system_stats().processing.is_running);
}

#[tokio::test]
async fn test_analytics_over_ingested_samples() {
    let config = Config {
        batch_size: 5,
        prediction_enabled: true,
        ..Config::default()
    };
    let store = Arc::new(MemoryStore::new());
    let monitor = Monitor::with_notifier(&config, store, Arc::new(LogNotifier)).unwrap();
    monitor.registry.register_device(device("D1", "press")).unwrap();
    monitor.registry.add_sensor("D1", sensor("S1", 190.0)).unwrap();

    let base = Utc::now() - Duration::minutes(10);
    for (i, value) in [10.0, 11.0, 9.0, 10.0, 95.0].into_iter().enumerate() {
        let sample = SensorSample::new("D1", "S1", value).at(base + Duration::seconds(i as i64));
        monitor.pipeline.process_sensor_data(sample).await.unwrap();
    }

    let start = base - Duration::minutes(1);
    let end = Utc::now();
    let report = monitor
        .analytics
        .analyze_sensor_data("D1", "S1", start, end)
        .await
        .unwrap();
    assert_eq!(report.data_points, 5);
    assert_eq!(report.anomalies.len(), 1);
    assert_eq!(report.anomalies[0].value, 95.0);
    assert_eq!(report.prediction.map(|p| p.len()), Some(10));
    assert_eq!(report.statistics.max, 95.0);
}

#[tokio::test]
#[ignore]
async fn test_ingest_throughput() {
    let config = Config {
        batch_size: 500,
        ..Config::default()
    };
    let registry = Arc::new(Registry::new(&config));
    for d in 0..10 {
        let id = format!("dev-{}", d);
        registry.register_device(device(&id, &id)).unwrap();
        registry.add_sensor(&id, sensor("temp", 1_000.0)).unwrap();
    }
    let store = Arc::new(MemoryStore::new());
    let pipeline = Arc::new(Pipeline::new(&config, registry, store.clone()));
    pipeline.start().unwrap();

    let total = 100_000;
    let started = Instant::now();
    for i in 0..total {
        let sample = SensorSample::new(format!("dev-{}", i % 10), "temp", (i % 200) as f64);
        pipeline.process_sensor_data(sample).await.unwrap();
    }
    pipeline.stop().await.unwrap();
    let elapsed = started.elapsed();

    println!("Ingested {} samples in {:?}", total, elapsed);
    println!("Throughput: {:.0} samples/s", total as f64 / elapsed.as_secs_f64());
    assert_eq!(store.len(), total);
}
