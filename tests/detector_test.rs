mod common;

use chrono::Utc;
use common::TestApp;
use sea_orm::{ActiveModelTrait, Set};
use serde_json::json;
use stockwatch::entities::alert::{AlertType, Severity};
use stockwatch::entities::metric::{EntityKind, MetricType};
use stockwatch::entities::model_artifact;
use stockwatch::services::detector::{evaluate_zscore, FallbackStats};

/// Register an active catalog row whose backing file holds garbage.
async fn plant_corrupt_artifact(app: &TestApp, metric_type: MetricType) {
    let path = app.store.root().join("isolation_forest_corrupt.bin");
    std::fs::write(&path, b"definitely not a serialized forest").expect("write corrupt file");

    let row = model_artifact::ActiveModel {
        model_type: Set("isolation_forest".to_string()),
        metric_type: Set(metric_type.as_str().to_string()),
        model_path: Set(Some(path.to_string_lossy().into_owned())),
        payload: Set(None),
        parameters: Set(json!({})),
        training_date: Set(Utc::now()),
        accuracy: Set(None),
        precision: Set(None),
        recall: Set(None),
        is_active: Set(true),
        ..Default::default()
    };
    row.insert(app.db.as_ref()).await.expect("artifact row");
}

#[tokio::test]
async fn corrupt_artifact_falls_back_to_zscore_and_counts_the_cause() {
    let app = TestApp::new().await;
    plant_corrupt_artifact(&app, MetricType::StockLevel).await;

    let values = [10.0, 10.0, 11.0, 9.0, 10.0, 50.0];
    let mut tracker = FallbackStats::default();
    let detection = app
        .detector()
        .detect_with_model(MetricType::StockLevel, &values, 3.0, &mut tracker)
        .await
        .expect("detection");

    // Same tuple shape and values as the statistical strategy.
    assert_eq!(detection, evaluate_zscore(&values, 3.0));
    assert!(detection.is_anomaly);

    assert_eq!(tracker.attempts, 1);
    assert_eq!(tracker.fallbacks, 1);
    assert_eq!(tracker.corrupt_artifact, 1);
    assert_eq!(tracker.missing_artifact, 0);
    assert_eq!(tracker.load_error, 0);
    assert_eq!(tracker.inference_error, 0);
}

#[tokio::test]
async fn negative_stock_is_always_critical_regardless_of_history() {
    let app = TestApp::new().await;
    // A single observation: far too short for either scoring strategy.
    app.insert_metric(MetricType::StockLevel, EntityKind::Product, 11, -5.0, 0)
        .await;

    let mut tracker = FallbackStats::default();
    let report = app
        .detector()
        .run_pass(&mut tracker)
        .await
        .expect("detection pass");

    assert_eq!(report.total, 1);
    let alerts = app.alerts.active(None, None).await.expect("active alerts");
    assert_eq!(alerts.len(), 1);
    let alert = &alerts[0];
    assert_eq!(alert.alert_type, AlertType::StockAnomaly.as_str());
    assert_eq!(alert.severity(), Severity::Critical);
    assert_eq!(alert.deviation_percent, 100.0);
    assert_eq!(alert.metric_value, -5.0);
    assert!(alert.message.contains("NEGATIVE STOCK"));
}

#[tokio::test]
async fn zscore_pass_flags_the_outlier_series_only() {
    let app = TestApp::new().await;
    app.insert_series(
        MetricType::StockLevel,
        EntityKind::Product,
        1,
        &[10.0, 10.0, 11.0, 9.0, 10.0, 50.0],
    )
    .await;
    app.insert_series(
        MetricType::StockLevel,
        EntityKind::Product,
        2,
        &[10.0, 10.0, 11.0, 9.0, 10.0, 12.0],
    )
    .await;

    let mut tracker = FallbackStats::default();
    let report = app
        .detector()
        .run_pass(&mut tracker)
        .await
        .expect("detection pass");

    assert_eq!(report.total, 1);
    // No artifact exists, so the model path was never attempted.
    assert_eq!(tracker.attempts, 0);

    let alerts = app.alerts.active(None, None).await.expect("active alerts");
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].entity_id, 1);
    assert_eq!(alerts[0].expected_value, 10.0);
}

#[tokio::test]
async fn repeat_pass_inside_dedup_window_does_not_duplicate_the_alert() {
    let app = TestApp::new().await;
    app.insert_series(
        MetricType::StockLevel,
        EntityKind::Product,
        1,
        &[10.0, 10.0, 11.0, 9.0, 10.0, 50.0],
    )
    .await;
    let detector = app.detector();

    let mut tracker = FallbackStats::default();
    let first = detector.run_pass(&mut tracker).await.expect("first pass");
    let second = detector.run_pass(&mut tracker).await.expect("second pass");

    assert_eq!(first.total, 1);
    assert_eq!(second.total, 0);
    assert_eq!(app.alerts.active(None, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn short_series_are_skipped_without_alerting() {
    let app = TestApp::new().await;
    app.insert_series(
        MetricType::ConsumptionRate,
        EntityKind::Room,
        4,
        &[5.0, 900.0],
    )
    .await;

    let mut tracker = FallbackStats::default();
    let report = app
        .detector()
        .run_pass(&mut tracker)
        .await
        .expect("detection pass");

    assert_eq!(report.total, 0);
    assert!(app.alerts.active(None, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn direction_gate_ignores_fast_task_completions() {
    let app = TestApp::new().await;
    // Task-duration profile only alerts above the mean; a suspiciously fast
    // outlier stays quiet.
    app.insert_series(
        MetricType::TaskDuration,
        EntityKind::Staff,
        6,
        &[30.0, 32.0, 31.0, 29.0, 30.0, 1.0],
    )
    .await;

    let mut tracker = FallbackStats::default();
    let report = app
        .detector()
        .run_pass(&mut tracker)
        .await
        .expect("detection pass");

    assert_eq!(report.total, 0);
}
