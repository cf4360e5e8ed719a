//! Warehouse store against a real PostgreSQL.
//!
//! Needs Docker: `cargo test -p medgram-storage -- --ignored`

use chrono::{TimeZone, Utc};
use medgram_storage::{
    DatabaseConfig, Detection, Enrichment, EnrichmentOutcome, Message, PgWarehouse,
    WarehouseStore,
};
use std::sync::Arc;
use testcontainers::core::WaitFor;
use testcontainers::{clients, GenericImage};

fn postgres_image() -> GenericImage {
    GenericImage::new("postgres", "16-alpine")
        .with_env_var("POSTGRES_USER", "medgram")
        .with_env_var("POSTGRES_PASSWORD", "medgram")
        .with_env_var("POSTGRES_DB", "medical_warehouse")
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
}

async fn connect(port: u16) -> PgWarehouse {
    let config = DatabaseConfig {
        host: "127.0.0.1".to_string(),
        port,
        user: Some("medgram".to_string()),
        password: Some("medgram".to_string()),
        ..Default::default()
    };

    // The server restarts once after init; give it a second attempt
    let store = match PgWarehouse::connect(&config).await {
        Ok(store) => store,
        Err(_) => {
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            PgWarehouse::connect(&config).await.expect("connect to postgres")
        }
    };
    store.run_migrations().await.expect("run migrations");
    store
}

fn message(id: i64, has_media: bool) -> Message {
    Message {
        message_id: id,
        channel_name: "chan_a".to_string(),
        message_date: Utc.with_ymd_and_hms(2025, 1, 15, 10, 30, 0).unwrap(),
        message_text: String::new(),
        views: 120,
        forwards: 3,
        has_media,
        image_path: has_media.then(|| format!("{id}.jpg")),
    }
}

fn syringe(message_id: i64, confidence: f32) -> Detection {
    Detection {
        message_id,
        channel_name: "chan_a".to_string(),
        detected_class: "syringe".to_string(),
        confidence_score: confidence,
    }
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_warehouse_round_trip() {
    let docker = clients::Cli::default();
    let node = docker.run(postgres_image());
    let store = Arc::new(connect(node.get_host_port_ipv4(5432)).await);

    // Loading twice keeps one row per message
    for _ in 0..2 {
        store.upsert_message_if_absent(&message(1, false)).await.unwrap();
        store.upsert_message_if_absent(&message(2, true)).await.unwrap();
    }
    let summary = store.summary().await.unwrap();
    assert_eq!(summary.total_messages, 2);
    assert_eq!(summary.messages_with_media, 1);

    // Concurrent enrichment of the same image writes its rows once
    let enrichment = Enrichment {
        message_id: 2,
        channel_name: "chan_a".to_string(),
        model_version: "yolov8n".to_string(),
        detections: vec![syringe(2, 0.9), syringe(2, 0.4)],
    };
    let attempts = (0..4).map(|_| {
        let store = store.clone();
        let enrichment = enrichment.clone();
        tokio::spawn(async move { store.record_enrichment(&enrichment).await.unwrap() })
    });
    let outcomes = futures::future::join_all(attempts).await;
    let recorded = outcomes
        .into_iter()
        .filter(|o| matches!(o, Ok(EnrichmentOutcome::Recorded(2))))
        .count();
    assert_eq!(recorded, 1);
    assert_eq!(store.list_detections().await.unwrap().len(), 2);

    // No-media message refuses detections
    let refused = Enrichment {
        message_id: 1,
        detections: vec![syringe(1, 0.7)],
        ..enrichment
    };
    assert_eq!(
        store.record_enrichment(&refused).await.unwrap(),
        EnrichmentOutcome::MessageWithoutMedia
    );
    assert!(!store.has_detections(1).await.unwrap());

    // Ties ordered by name
    for id in 0..3 {
        store.record_product_mention(id, "paracetamol").await.unwrap();
        store.record_product_mention(100 + id, "ibuprofen").await.unwrap();
    }
    let top = store.query_top_products(1).await.unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].product_name, "ibuprofen");
    assert_eq!(top[0].mention_count, 3);

    assert!(store.query_top_products(0).await.is_err());
}
