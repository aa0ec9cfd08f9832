mod common;

use chrono::Utc;
use common::TestApp;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use serde_json::json;
use stockwatch::entities::metric::MetricType;
use stockwatch::entities::model_artifact::{self, Entity as ArtifactEntity};
use stockwatch::errors::ServiceError;
use stockwatch::ml::isolation_forest::{ForestConfig, IsolationForest, StandardScaler};
use stockwatch::ml::DetectorArtifact;
use stockwatch::services::model_store::{ArtifactQuality, ModelStore};

fn sample_artifact() -> DetectorArtifact {
    let values: Vec<f64> = (0..64).map(|i| 10.0 + (i % 8) as f64 * 0.25).collect();
    let scaler = StandardScaler::fit(&values);
    let scaled: Vec<f64> = values.iter().map(|v| scaler.transform(*v)).collect();
    let forest = IsolationForest::fit(&scaled, ForestConfig::default()).expect("fit forest");
    DetectorArtifact::new(forest, Some(scaler))
}

async fn active_rows(app: &TestApp, metric_type: MetricType) -> Vec<model_artifact::Model> {
    ArtifactEntity::find()
        .filter(model_artifact::Column::ModelType.eq("isolation_forest"))
        .filter(model_artifact::Column::MetricType.eq(metric_type.as_str()))
        .filter(model_artifact::Column::IsActive.eq(true))
        .all(app.db.as_ref())
        .await
        .expect("query active rows")
}

fn bin_files(store: &ModelStore) -> Vec<std::path::PathBuf> {
    std::fs::read_dir(store.root())
        .expect("read store root")
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("bin"))
        .collect()
}

#[tokio::test]
async fn saving_twice_leaves_exactly_one_active_version() {
    let app = TestApp::new().await;
    let artifact = sample_artifact();

    let first = app
        .store
        .save(
            &artifact,
            "isolation_forest",
            MetricType::StockLevel,
            ArtifactQuality::default(),
        )
        .await
        .expect("first save");
    let second = app
        .store
        .save(
            &artifact,
            "isolation_forest",
            MetricType::StockLevel,
            ArtifactQuality::default(),
        )
        .await
        .expect("second save");
    assert_ne!(first, second);

    let active = active_rows(&app, MetricType::StockLevel).await;
    assert_eq!(active.len(), 1);
    assert_eq!(
        active[0].model_path.as_deref(),
        Some(second.to_string_lossy().as_ref())
    );
}

#[tokio::test]
async fn save_then_load_round_trips_the_artifact() {
    let app = TestApp::new().await;
    let artifact = sample_artifact();
    app.store
        .save(
            &artifact,
            "isolation_forest",
            MetricType::ConsumptionRate,
            ArtifactQuality {
                accuracy: Some(0.93),
                precision: Some(0.85),
                recall: Some(0.80),
            },
        )
        .await
        .expect("save");

    let loaded = app
        .store
        .load("isolation_forest", MetricType::ConsumptionRate)
        .await
        .expect("load")
        .expect("active artifact");
    assert_eq!(loaded.forest.threshold(), artifact.forest.threshold());
    assert_eq!(loaded.score(10.5), artifact.score(10.5));

    let info = app
        .store
        .info("isolation_forest", MetricType::ConsumptionRate)
        .await
        .expect("info")
        .expect("model info");
    assert_eq!(info.accuracy, Some(0.93));
    assert!(info.size_bytes > 0);
}

#[tokio::test]
async fn load_returns_none_when_no_active_row_exists() {
    let app = TestApp::new().await;
    let loaded = app
        .store
        .load("isolation_forest", MetricType::TaskDuration)
        .await
        .expect("load");
    assert!(loaded.is_none());
}

#[tokio::test]
async fn cleanup_keeps_the_newest_versions_and_removes_the_rest() {
    let app = TestApp::new().await;
    let artifact = sample_artifact();
    for _ in 0..5 {
        app.store
            .save(
                &artifact,
                "isolation_forest",
                MetricType::StockLevel,
                ArtifactQuality::default(),
            )
            .await
            .expect("save");
    }
    assert_eq!(bin_files(&app.store).len(), 5);

    let report = app.store.cleanup(3).await.expect("cleanup");

    assert_eq!(report.deleted_files, 2);
    let remaining = bin_files(&app.store);
    assert_eq!(remaining.len(), 3);
    // The surviving catalog rows all still have their backing files.
    let rows_with_files = ArtifactEntity::find()
        .all(app.db.as_ref())
        .await
        .expect("rows")
        .into_iter()
        .filter(|r| {
            r.model_path
                .as_deref()
                .map(|p| std::path::Path::new(p).exists())
                .unwrap_or(false)
        })
        .count();
    assert_eq!(rows_with_files, 3);
}

#[tokio::test]
async fn catalog_row_escaping_the_store_root_is_a_security_error() {
    let app = TestApp::new().await;
    let row = model_artifact::ActiveModel {
        model_type: Set("isolation_forest".to_string()),
        metric_type: Set(MetricType::StockLevel.as_str().to_string()),
        model_path: Set(Some("../../../etc/passwd".to_string())),
        payload: Set(None),
        parameters: Set(json!({})),
        training_date: Set(Utc::now()),
        accuracy: Set(None),
        precision: Set(None),
        recall: Set(None),
        is_active: Set(true),
        ..Default::default()
    };
    row.insert(app.db.as_ref()).await.expect("insert row");

    let err = app
        .store
        .load("isolation_forest", MetricType::StockLevel)
        .await
        .expect_err("traversal must fail");
    assert!(matches!(err, ServiceError::Security(_)));
}

#[tokio::test]
async fn corrupt_file_is_classified_after_bounded_retries() {
    let app = TestApp::new().await;
    let path = app.store.root().join("isolation_forest_bad.bin");
    std::fs::write(&path, b"{\"not\": \"an artifact\"}").expect("write");
    let row = model_artifact::ActiveModel {
        model_type: Set("isolation_forest".to_string()),
        metric_type: Set(MetricType::StockLevel.as_str().to_string()),
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
    row.insert(app.db.as_ref()).await.expect("insert row");

    let err = app
        .store
        .load("isolation_forest", MetricType::StockLevel)
        .await
        .expect_err("corrupt artifact must fail");
    assert!(matches!(err, ServiceError::ArtifactCorrupt(_)));
}

#[tokio::test]
async fn load_retries_follow_the_exponential_backoff_schedule() {
    let app = TestApp::new().await;
    let mut config = app.config.model_store.clone();
    config.backoff_base_ms = 50;
    let store = ModelStore::new(app.db.clone(), &config).expect("store");

    let path = store.root().join("isolation_forest_bad.bin");
    std::fs::write(&path, b"garbage").expect("write");
    let row = model_artifact::ActiveModel {
        model_type: Set("isolation_forest".to_string()),
        metric_type: Set(MetricType::StockLevel.as_str().to_string()),
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
    row.insert(app.db.as_ref()).await.expect("insert row");

    // Three attempts mean two waits: base, then double the base.
    let started = std::time::Instant::now();
    let err = store
        .load("isolation_forest", MetricType::StockLevel)
        .await
        .expect_err("corrupt artifact must fail");
    let waited = started.elapsed();

    assert!(matches!(err, ServiceError::ArtifactCorrupt(_)));
    assert!(waited >= std::time::Duration::from_millis(150));
}

#[tokio::test]
async fn legacy_inline_payload_is_migrated_to_a_file_on_load() {
    let app = TestApp::new().await;
    let artifact = sample_artifact();
    let payload = serde_json::to_vec(&artifact).expect("serialize");

    let row = model_artifact::ActiveModel {
        model_type: Set("isolation_forest".to_string()),
        metric_type: Set(MetricType::TaskDuration.as_str().to_string()),
        model_path: Set(None),
        payload: Set(Some(payload)),
        parameters: Set(json!({})),
        training_date: Set(Utc::now()),
        accuracy: Set(None),
        precision: Set(None),
        recall: Set(None),
        is_active: Set(true),
        ..Default::default()
    };
    let inserted = row.insert(app.db.as_ref()).await.expect("insert row");

    let loaded = app
        .store
        .load("isolation_forest", MetricType::TaskDuration)
        .await
        .expect("load")
        .expect("artifact");
    assert_eq!(loaded.forest.threshold(), artifact.forest.threshold());

    let migrated = ArtifactEntity::find_by_id(inserted.id)
        .one(app.db.as_ref())
        .await
        .expect("query")
        .expect("row");
    assert!(migrated.payload.is_none());
    let path = migrated.model_path.expect("file-backed after migration");
    assert!(std::path::Path::new(&path).exists());
}

#[tokio::test]
async fn quota_pressure_triggers_emergency_cleanup_before_the_write() {
    let app = TestApp::new().await;
    let artifact = sample_artifact();
    let size = serde_json::to_vec(&artifact).expect("serialize").len() as u64;

    let mut config = app.config.model_store.clone();
    config.max_store_bytes = size * 3;
    let store = ModelStore::new(app.db.clone(), &config).expect("store");

    for _ in 0..3 {
        store
            .save(
                &artifact,
                "isolation_forest",
                MetricType::StockLevel,
                ArtifactQuality::default(),
            )
            .await
            .expect("save");
    }

    // The third save only fit because the emergency pass dropped the oldest
    // inactive versions first.
    assert!(bin_files(&store).len() <= 2);
    assert_eq!(active_rows(&app, MetricType::StockLevel).await.len(), 1);
}

#[tokio::test]
async fn exhausted_quota_is_a_hard_error() {
    let app = TestApp::new().await;
    let artifact = sample_artifact();

    let mut config = app.config.model_store.clone();
    config.max_store_bytes = 64;
    let store = ModelStore::new(app.db.clone(), &config).expect("store");

    let err = store
        .save(
            &artifact,
            "isolation_forest",
            MetricType::StockLevel,
            ArtifactQuality::default(),
        )
        .await
        .expect_err("save must fail");
    assert!(matches!(err, ServiceError::DiskQuotaExceeded(_)));
}

#[tokio::test]
async fn orphaned_files_are_swept_by_cleanup() {
    let app = TestApp::new().await;
    let orphan = app.store.root().join("isolation_forest_orphan.bin");
    std::fs::write(&orphan, b"leftover from an interrupted save").expect("write");

    let report = app.store.cleanup(3).await.expect("cleanup");

    assert_eq!(report.orphan_files_removed, 1);
    assert!(!orphan.exists());
}
