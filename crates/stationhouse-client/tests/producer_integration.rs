//! Integration tests for the Producer API.
//!
//! These run producers against the emulated control plane and check where
//! messages land in the in-memory broker.

mod common;

use common::{eventually, init_tracing, ControlPlane, CountingBroker};
use std::collections::HashSet;
use std::sync::Arc;
use stationhouse_client::{ClientError, ProduceOptions, ProducerOptions, StationOptions};

fn sync() -> ProduceOptions {
    ProduceOptions::default().async_ack(false)
}

#[tokio::test]
async fn test_round_robin_visits_every_partition_evenly() {
    init_tracing();
    let plane = ControlPlane::new();
    plane.station("orders", 3);
    let producer = plane
        .client()
        .create_producer(ProducerOptions::new("orders", "checkout"))
        .await
        .unwrap();
    assert_eq!(producer.targets()[0].partitions(), vec![1, 2, 3]);

    for i in 0..9 {
        producer.produce(format!("m{i}"), sync()).await.unwrap();
    }

    for partition in 1..=3 {
        assert_eq!(plane.stored(&format!("orders${partition}")).len(), 3);
    }
}

#[tokio::test]
async fn test_first_cycle_is_a_permutation() {
    let plane = ControlPlane::new();
    plane.station("orders", 5);
    let producer = plane
        .client()
        .create_producer(ProducerOptions::new("orders", "checkout"))
        .await
        .unwrap();

    let mut touched = HashSet::new();
    for _ in 0..5 {
        producer.produce("x", sync()).await.unwrap();
        for partition in 1..=5u32 {
            if !plane.stored(&format!("orders${partition}")).is_empty() {
                touched.insert(partition);
            }
        }
    }
    assert_eq!(touched.len(), 5);
}

#[tokio::test]
async fn test_partition_key_is_sticky() {
    let plane = ControlPlane::new();
    plane.station("orders", 4);
    let producer = plane
        .client()
        .create_producer(ProducerOptions::new("orders", "checkout"))
        .await
        .unwrap();

    for _ in 0..6 {
        producer
            .produce("x", sync().partition_key("user-42"))
            .await
            .unwrap();
    }

    let counts: Vec<usize> = (1..=4)
        .map(|p| plane.stored(&format!("orders${p}")).len())
        .collect();
    assert_eq!(counts.iter().filter(|&&c| c == 6).count(), 1);
    assert_eq!(counts.iter().sum::<usize>(), 6);
}

#[tokio::test]
async fn test_explicit_partition_number() {
    let plane = ControlPlane::new();
    plane.station("orders", 3);
    let producer = plane
        .client()
        .create_producer(ProducerOptions::new("orders", "checkout"))
        .await
        .unwrap();

    producer
        .produce("x", sync().partition_number(2))
        .await
        .unwrap();
    assert_eq!(plane.stored("orders$2").len(), 1);

    let err = producer
        .produce("x", sync().partition_number(9))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::InvalidPartition { partition: 9, .. }));
}

#[tokio::test]
async fn test_ambiguous_selector_publishes_nothing() {
    let plane = ControlPlane::new();
    plane.station("orders", 2);
    let counting = Arc::new(CountingBroker::new(plane.broker.clone()));
    let producer = plane
        .client_on(counting.clone())
        .create_producer(ProducerOptions::new("orders", "checkout"))
        .await
        .unwrap();

    let err = producer
        .produce("x", sync().partition_key("k").partition_number(1))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::AmbiguousPartitionSelector));
    assert!(err.is_caller_misuse());
    assert_eq!(counting.stream_publishes(), 0);
}

#[tokio::test]
async fn test_empty_message_id_is_rejected() {
    let plane = ControlPlane::new();
    plane.station("orders", 1);
    let counting = Arc::new(CountingBroker::new(plane.broker.clone()));
    let producer = plane
        .client_on(counting.clone())
        .create_producer(ProducerOptions::new("orders", "checkout"))
        .await
        .unwrap();

    let err = producer
        .produce("x", sync().message_id(""))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::EmptyMessageId));
    assert_eq!(counting.stream_publishes(), 0);
}

#[tokio::test]
async fn test_message_id_deduplicates() {
    let plane = ControlPlane::new();
    plane.station("orders", 1);
    let producer = plane
        .client()
        .create_producer(ProducerOptions::new("orders", "checkout"))
        .await
        .unwrap();

    producer.produce("a", sync().message_id("order-1")).await.unwrap();
    producer.produce("a", sync().message_id("order-1")).await.unwrap();
    assert_eq!(plane.stored("orders").len(), 1);
}

#[tokio::test]
async fn test_no_responders_recreates_producer_once() {
    init_tracing();
    let plane = ControlPlane::new();
    plane.station("orders", 1);
    let producer = plane
        .client()
        .create_producer(ProducerOptions::new("orders", "checkout"))
        .await
        .unwrap();
    assert_eq!(plane.producer_creations(), 1);

    // Stream vanished behind the producer's back.
    plane.broker.delete_stream("orders");
    producer.produce("after", sync()).await.unwrap();

    assert_eq!(plane.producer_creations(), 2);
    assert_eq!(plane.stored("orders").len(), 1);
}

#[tokio::test]
async fn test_no_responders_twice_gives_up_after_one_recreate() {
    let plane = ControlPlane::new();
    plane.station("orders", 1);
    let counting = Arc::new(CountingBroker::new(plane.broker.clone()));
    let producer = plane
        .client_on(counting.clone())
        .create_producer(ProducerOptions::new("orders", "checkout"))
        .await
        .unwrap();

    counting.refuse_stream_publishes(true);
    let err = producer.produce("lost", sync()).await.unwrap_err();

    assert!(err.is_no_responders());
    assert_eq!(plane.producer_creations(), 2);
    assert_eq!(counting.stream_publishes(), 2);
    assert!(plane.stored("orders").is_empty());
}

#[tokio::test]
async fn test_async_ack_lands_eventually() {
    let plane = ControlPlane::new();
    plane.station("orders", 1);
    let producer = plane
        .client()
        .create_producer(ProducerOptions::new("orders", "checkout"))
        .await
        .unwrap();

    for _ in 0..3 {
        producer.produce("x", ProduceOptions::default()).await.unwrap();
    }
    assert!(eventually(|| plane.stored("orders").len() == 3).await);
}

#[tokio::test]
async fn test_multi_station_fan_out() {
    let plane = ControlPlane::new();
    plane.station("orders", 1).station("audit", 2);
    let client = plane.client();
    let producer = client
        .create_producer(ProducerOptions::multi(["orders", "audit"], "mirror"))
        .await
        .unwrap();
    assert!(producer.is_multi_station());
    assert_eq!(producer.stations(), vec!["orders", "audit"]);

    producer.produce("x", sync()).await.unwrap();
    assert_eq!(plane.stored("orders").len(), 1);
    let audit: usize = (1..=2).map(|p| plane.stored(&format!("audit${p}")).len()).sum();
    assert_eq!(audit, 1);

    producer.destroy().await.unwrap();
}

#[tokio::test]
async fn test_fan_out_stops_at_failing_station() {
    let plane = ControlPlane::new();
    plane.station("orders", 1);
    plane.station_with_schema("audit", 1, r#"{"type":"object","required":["id"]}"#);
    plane.station("ledger", 1);
    let producer = plane
        .client()
        .create_producer(ProducerOptions::multi(["orders", "audit", "ledger"], "mirror"))
        .await
        .unwrap();

    let err = producer.produce("not json", sync()).await.unwrap_err();
    assert!(matches!(err, ClientError::SchemaValidation { ref station, .. } if station == "audit"));

    // Stations before the failure keep the message; later ones never see it.
    assert_eq!(plane.stored("orders").len(), 1);
    assert!(plane.stored("audit").is_empty());
    assert!(plane.stored("ledger").is_empty());
}

#[tokio::test]
async fn test_station_created_then_produced_to() {
    let plane = ControlPlane::new();
    let client = plane.client();
    let station = client
        .create_station(StationOptions::new("Payments").partitions(2))
        .await
        .unwrap();
    assert_eq!(station.internal_name(), "payments");

    let producer = client
        .create_producer(ProducerOptions::new("Payments", "ledger").unique_suffix(true))
        .await
        .unwrap();
    assert!(producer.name().starts_with("ledger_"));
    assert_eq!(producer.targets()[0].partitions(), vec![1, 2]);

    producer.produce("x", sync()).await.unwrap();
    let total: usize = (1..=2).map(|p| plane.stored(&format!("payments${p}")).len()).sum();
    assert_eq!(total, 1);
}

#[tokio::test]
async fn test_closed_client_rejects_new_producers() {
    let plane = ControlPlane::new();
    plane.station("orders", 1);
    let client = plane.client();
    client.close().await;

    let err = client
        .create_producer(ProducerOptions::new("orders", "checkout"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Broker(_)));
}
