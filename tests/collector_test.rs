mod common;

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use common::{FakeMetricSource, TestApp};
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use stockwatch::entities::metric::{self, Entity as MetricEntity, EntityKind, MetricType};
use stockwatch::services::collector::{EntityObservation, LedgerTransaction, StockObservation};

async fn count_rows(app: &TestApp, metric_type: MetricType, entity_id: i64) -> u64 {
    MetricEntity::find()
        .filter(metric::Column::MetricType.eq(metric_type.as_str()))
        .filter(metric::Column::EntityId.eq(entity_id))
        .count(app.db.as_ref())
        .await
        .expect("count query")
}

fn room_reading(entity_id: i64, value: f64) -> EntityObservation {
    EntityObservation {
        entity_id,
        name: Some(format!("Room {entity_id}")),
        value,
    }
}

#[tokio::test]
async fn collecting_twice_inside_dedup_window_stores_one_metric() {
    let app = TestApp::new().await;
    let source = Arc::new(FakeMetricSource {
        consumption: vec![room_reading(7, 12.0)],
        ..Default::default()
    });
    let collector = app.collector(source);

    let first = collector.run().await.expect("first pass");
    let second = collector.run().await.expect("second pass");

    assert_eq!(first.written, 1);
    assert_eq!(second.written, 0);
    assert!(second.skipped >= 1);
    assert_eq!(count_rows(&app, MetricType::ConsumptionRate, 7).await, 1);
}

#[tokio::test]
async fn stock_is_resampled_only_when_the_level_moves() {
    let app = TestApp::new().await;

    // Prior sample outside the dedup window with the same level: the change
    // gate, not the dedup window, must do the skipping.
    app.insert_metric(MetricType::StockLevel, EntityKind::Product, 42, 50.0, 10)
        .await;

    let unchanged = app.collector(Arc::new(FakeMetricSource {
        stock: vec![StockObservation {
            product_id: 42,
            name: "Sparkling Water".to_string(),
            on_hand: 50.0,
            critical_level: Some(10.0),
        }],
        ..Default::default()
    }));
    let report = unchanged.run().await.expect("unchanged pass");
    assert_eq!(report.written, 0);
    assert_eq!(count_rows(&app, MetricType::StockLevel, 42).await, 1);

    let moved = app.collector(Arc::new(FakeMetricSource {
        stock: vec![StockObservation {
            product_id: 42,
            name: "Sparkling Water".to_string(),
            on_hand: 38.0,
            critical_level: Some(10.0),
        }],
        ..Default::default()
    }));
    let report = moved.run().await.expect("moved pass");
    assert_eq!(report.written, 1);
    assert_eq!(count_rows(&app, MetricType::StockLevel, 42).await, 2);
}

#[tokio::test]
async fn transaction_scan_is_incremental_and_survives_double_fire() {
    let app = TestApp::new().await;
    let now = Utc::now();
    let source = Arc::new(FakeMetricSource {
        transactions: vec![
            LedgerTransaction {
                transaction_id: 1,
                product_id: 3,
                delta: 24.0,
                kind: "receipt".to_string(),
                occurred_at: now - ChronoDuration::hours(2),
            },
            LedgerTransaction {
                transaction_id: 2,
                product_id: 3,
                delta: -6.0,
                kind: "issue".to_string(),
                occurred_at: now - ChronoDuration::hours(1),
            },
        ],
        ..Default::default()
    });
    let collector = app.collector(source);

    let first = collector.run().await.expect("first pass");
    assert_eq!(first.written, 2);
    assert_eq!(count_rows(&app, MetricType::StockMovement, 3).await, 2);
    assert_eq!(count_rows(&app, MetricType::CollectionMarker, 0).await, 1);

    // Double-fire: the marker moved past both transactions, nothing repeats.
    let second = collector.run().await.expect("second pass");
    assert_eq!(second.written, 0);
    assert_eq!(count_rows(&app, MetricType::StockMovement, 3).await, 2);
    assert_eq!(count_rows(&app, MetricType::CollectionMarker, 0).await, 2);
}

#[tokio::test]
async fn one_failing_category_never_aborts_the_pass() {
    let app = TestApp::new().await;
    let source = Arc::new(FakeMetricSource {
        stock: vec![StockObservation {
            product_id: 1,
            name: "Juice".to_string(),
            on_hand: 9.0,
            critical_level: None,
        }],
        scans: vec![EntityObservation {
            entity_id: 5,
            name: None,
            value: 14.0,
        }],
        fail_consumption: true,
        ..Default::default()
    });

    let report = app.collector(source).run().await.expect("pass");

    assert_eq!(report.failures, 1);
    assert_eq!(count_rows(&app, MetricType::StockLevel, 1).await, 1);
    assert_eq!(count_rows(&app, MetricType::ScanFrequency, 5).await, 1);
}

#[tokio::test]
async fn custody_positions_produce_usage_and_shrinkage_series() {
    let app = TestApp::new().await;
    let source = Arc::new(FakeMetricSource {
        custody: vec![stockwatch::services::collector::CustodyObservation {
            staff_id: 9,
            name: Some("R. Vega".to_string()),
            usage_percent: 61.0,
            shrinkage_percent: 4.5,
        }],
        ..Default::default()
    });

    let report = app.collector(source).run().await.expect("pass");

    assert_eq!(report.written, 2);
    assert_eq!(count_rows(&app, MetricType::CustodyUsage, 9).await, 1);
    assert_eq!(count_rows(&app, MetricType::CustodyShrinkage, 9).await, 1);
}

#[tokio::test]
async fn cleanup_purges_only_rows_past_the_horizon() {
    let app = TestApp::new().await;
    app.insert_metric(
        MetricType::ConsumptionRate,
        EntityKind::Room,
        2,
        5.0,
        100 * 24 * 60,
    )
    .await;
    app.insert_metric(MetricType::ConsumptionRate, EntityKind::Room, 2, 6.0, 30)
        .await;

    let collector = app.collector(Arc::new(FakeMetricSource::default()));
    let deleted = collector.cleanup_old_metrics(90).await.expect("cleanup");

    assert_eq!(deleted, 1);
    assert_eq!(count_rows(&app, MetricType::ConsumptionRate, 2).await, 1);
}
