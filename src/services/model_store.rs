use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, histogram};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde_json::json;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{error, info, instrument, warn};

use crate::config::ModelStoreConfig;
use crate::entities::metric::{self, EntityKind, MetricType};
use crate::entities::model_artifact::{self, ArtifactSource, Entity as ModelArtifactEntity};
use crate::errors::ServiceError;
use crate::ml::{DetectorArtifact, ARTIFACT_SCHEMA_VERSION};

/// Quality figures recorded with a saved artifact.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArtifactQuality {
    pub accuracy: Option<f64>,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
}

/// Catalog projection returned by `list` / `info`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelInfo {
    pub id: i64,
    pub model_type: String,
    pub metric_type: String,
    pub path: Option<String>,
    pub size_bytes: u64,
    pub accuracy: Option<f64>,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub training_date: DateTime<Utc>,
    pub is_active: bool,
}

/// Outcome of a retention pass.
#[derive(Debug, Default, serde::Serialize)]
pub struct CleanupReport {
    pub deleted_files: usize,
    pub deleted_rows: usize,
    pub orphan_files_removed: usize,
    pub missing_backing_files: usize,
    pub freed_bytes: u64,
    pub kept: Vec<String>,
}

/// Store directory usage against the configured quota.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct StoreUsage {
    pub used_bytes: u64,
    pub quota_bytes: u64,
    pub percent: f64,
}

#[derive(Debug, Default, serde::Serialize)]
pub struct OpStats {
    pub count: u64,
    pub success: u64,
    pub fail: u64,
    pub success_rate: f64,
    pub avg_ms: f64,
    pub p50_ms: f64,
}

#[derive(Debug, serde::Serialize)]
pub struct PerformanceStats {
    pub period_hours: i64,
    pub save: OpStats,
    pub load: OpStats,
    pub usage: StoreUsage,
}

/// Persists and retrieves trained detector artifacts.
///
/// Files live under a single root directory; metadata lives in the
/// `model_artifacts` catalog. Activation is transactional: the file is fully
/// written before the catalog commit that flips `is_active`, so an
/// interrupted save leaves the previous version authoritative and at worst
/// an orphaned file for cleanup to sweep.
#[derive(Clone)]
pub struct ModelStore {
    db: Arc<DatabaseConnection>,
    root: PathBuf,
    config: ModelStoreConfig,
}

impl ModelStore {
    /// Create the store, creating and canonicalizing the root directory.
    pub fn new(db: Arc<DatabaseConnection>, config: &ModelStoreConfig) -> Result<Self, ServiceError> {
        let root = PathBuf::from(&config.root);
        std::fs::create_dir_all(&root)
            .map_err(|e| ServiceError::ArtifactLoad(format!("cannot create model root: {e}")))?;
        let root = root
            .canonicalize()
            .map_err(|e| ServiceError::ArtifactLoad(format!("cannot resolve model root: {e}")))?;
        Ok(Self {
            db,
            root,
            config: config.clone(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a candidate path and verify it stays inside the store root.
    /// Violations are a hard `Security` error; nothing is sanitized.
    fn resolve_in_root(&self, candidate: &Path) -> Result<PathBuf, ServiceError> {
        if candidate
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(ServiceError::Security(format!(
                "path traversal attempt: {}",
                candidate.display()
            )));
        }
        let abs = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };
        let resolved = abs.canonicalize().unwrap_or_else(|_| abs.clone());
        if !resolved.starts_with(&self.root) {
            return Err(ServiceError::Security(format!(
                "path escapes model store root: {}",
                candidate.display()
            )));
        }
        Ok(abs)
    }

    fn artifact_filename(model_type: &str, metric_type: MetricType, now: DateTime<Utc>) -> String {
        format!(
            "{}_{}_{}.bin",
            model_type,
            metric_type.as_str(),
            now.format("%Y%m%d_%H%M%S")
        )
    }

    /// Pick a path for a new artifact, suffixing on collision so two saves
    /// inside the same second never share a file.
    fn unique_artifact_path(
        &self,
        model_type: &str,
        metric_type: MetricType,
    ) -> Result<PathBuf, ServiceError> {
        let base = Self::artifact_filename(model_type, metric_type, Utc::now());
        let mut candidate = self.root.join(&base);
        let mut n = 1u32;
        while candidate.exists() {
            let stem = base.trim_end_matches(".bin");
            candidate = self.root.join(format!("{stem}_{n}.bin"));
            n += 1;
        }
        self.resolve_in_root(&candidate)
    }

    fn dir_used_bytes(&self) -> u64 {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return 0;
        };
        entries
            .flatten()
            .filter_map(|e| e.metadata().ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .sum()
    }

    pub fn usage(&self) -> StoreUsage {
        let used = self.dir_used_bytes();
        let quota = self.config.max_store_bytes;
        StoreUsage {
            used_bytes: used,
            quota_bytes: quota,
            percent: if quota > 0 {
                used as f64 / quota as f64 * 100.0
            } else {
                0.0
            },
        }
    }

    /// Persist an artifact and activate it for (model_type, metric_type),
    /// deactivating the previous active version in the same transaction.
    #[instrument(skip(self, artifact, quality))]
    pub async fn save(
        &self,
        artifact: &DetectorArtifact,
        model_type: &str,
        metric_type: MetricType,
        quality: ArtifactQuality,
    ) -> Result<PathBuf, ServiceError> {
        let started = Instant::now();
        let result = self
            .save_inner(artifact, model_type, metric_type, quality)
            .await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
        histogram!("stockwatch_model_store.save_ms", elapsed_ms);

        match &result {
            Ok(path) => {
                let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
                info!(
                    model_type,
                    metric_type = %metric_type,
                    path = %path.display(),
                    size_bytes = size,
                    elapsed_ms,
                    "model artifact saved"
                );
                self.record_store_op("model_save", model_type, metric_type, elapsed_ms, size, true, None)
                    .await;
            }
            Err(e) => {
                counter!("stockwatch_model_store.save_errors", 1);
                error!(
                    model_type,
                    metric_type = %metric_type,
                    error = %e,
                    elapsed_ms,
                    "model artifact save failed"
                );
                self.record_store_op(
                    "model_save",
                    model_type,
                    metric_type,
                    elapsed_ms,
                    0,
                    false,
                    Some(&e.to_string()),
                )
                .await;
            }
        }
        result
    }

    async fn save_inner(
        &self,
        artifact: &DetectorArtifact,
        model_type: &str,
        metric_type: MetricType,
        quality: ArtifactQuality,
    ) -> Result<PathBuf, ServiceError> {
        let bytes = serde_json::to_vec(artifact)?;

        // Quota guard: above 90% utilization, run an emergency single-version
        // cleanup, then re-check once before refusing the write.
        let projected = self.dir_used_bytes() + bytes.len() as u64;
        if projected as f64 > self.config.max_store_bytes as f64 * 0.9 {
            warn!(
                used_bytes = projected,
                quota_bytes = self.config.max_store_bytes,
                "model store near quota, running emergency cleanup"
            );
            self.cleanup(1).await?;
            let retry_projected = self.dir_used_bytes() + bytes.len() as u64;
            if retry_projected as f64 > self.config.max_store_bytes as f64 * 0.9 {
                return Err(ServiceError::DiskQuotaExceeded(format!(
                    "{retry_projected} bytes needed, quota {}",
                    self.config.max_store_bytes
                )));
            }
        }

        let path = self.unique_artifact_path(model_type, metric_type)?;
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| ServiceError::ArtifactLoad(format!("write failed: {e}")))?;
        restrict_permissions(&path).await;

        let txn = self.db.begin().await?;
        let deactivate = model_artifact::ActiveModel {
            is_active: Set(false),
            ..Default::default()
        };
        ModelArtifactEntity::update_many()
            .set(deactivate)
            .filter(model_artifact::Column::ModelType.eq(model_type))
            .filter(model_artifact::Column::MetricType.eq(metric_type.as_str()))
            .filter(model_artifact::Column::IsActive.eq(true))
            .exec(&txn)
            .await?;

        let row = model_artifact::ActiveModel {
            model_type: Set(model_type.to_string()),
            metric_type: Set(metric_type.as_str().to_string()),
            model_path: Set(Some(path.to_string_lossy().into_owned())),
            payload: Set(None),
            parameters: Set(json!({
                "schema_version": ARTIFACT_SCHEMA_VERSION,
                "n_trees": artifact.forest.config().n_trees,
                "subsample": artifact.forest.config().subsample,
                "contamination": artifact.forest.config().contamination,
                "seed": artifact.forest.config().seed,
            })),
            training_date: Set(Utc::now()),
            accuracy: Set(quality.accuracy),
            precision: Set(quality.precision),
            recall: Set(quality.recall),
            is_active: Set(true),
            ..Default::default()
        };
        row.insert(&txn).await?;

        if let Err(e) = txn.commit().await {
            // The file is already on disk; remove it so a clean failure
            // leaves no orphan (a crash still can, and cleanup sweeps those).
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e.into());
        }

        Ok(path)
    }

    /// Load the active artifact for (model_type, metric_type).
    ///
    /// `Ok(None)` means no active catalog row exists. File-level failures
    /// (missing, oversized, undeserializable) are retried up to the
    /// configured attempt count with exponential backoff, then surfaced as
    /// classified errors for the detector's fallback accounting.
    #[instrument(skip(self))]
    pub async fn load(
        &self,
        model_type: &str,
        metric_type: MetricType,
    ) -> Result<Option<DetectorArtifact>, ServiceError> {
        let started = Instant::now();
        let mut last_err: Option<ServiceError> = None;

        let attempts = self.config.load_retries.max(1);
        for attempt in 0..attempts {
            if attempt > 0 {
                let delay_ms = self.config.backoff_base_ms.saturating_mul(1 << (attempt - 1));
                warn!(
                    model_type,
                    metric_type = %metric_type,
                    attempt,
                    delay_ms,
                    "retrying artifact load"
                );
                sleep(Duration::from_millis(delay_ms)).await;
            }

            match self.load_once(model_type, metric_type).await {
                Ok(found) => {
                    let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
                    histogram!("stockwatch_model_store.load_ms", elapsed_ms);
                    if found.is_some() {
                        self.record_store_op(
                            "model_load",
                            model_type,
                            metric_type,
                            elapsed_ms,
                            0,
                            true,
                            None,
                        )
                        .await;
                    }
                    return Ok(found);
                }
                Err(e) if e.triggers_fallback() => {
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
        let err = last_err.unwrap_or_else(|| {
            ServiceError::ArtifactLoad("load failed with no recorded cause".into())
        });
        counter!("stockwatch_model_store.load_errors", 1);
        self.record_store_op(
            "model_load",
            model_type,
            metric_type,
            elapsed_ms,
            0,
            false,
            Some(&err.to_string()),
        )
        .await;
        Err(err)
    }

    async fn load_once(
        &self,
        model_type: &str,
        metric_type: MetricType,
    ) -> Result<Option<DetectorArtifact>, ServiceError> {
        let row = ModelArtifactEntity::find()
            .filter(model_artifact::Column::ModelType.eq(model_type))
            .filter(model_artifact::Column::MetricType.eq(metric_type.as_str()))
            .filter(model_artifact::Column::IsActive.eq(true))
            .one(self.db.as_ref())
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        match row.source() {
            Some(ArtifactSource::FileBacked(path)) => {
                let path = self.resolve_in_root(&path)?;
                let artifact = self.read_and_validate(&path).await?;
                Ok(Some(artifact))
            }
            Some(ArtifactSource::Inline(bytes)) => {
                warn!(
                    model_type,
                    metric_type = %metric_type,
                    "loading legacy inline artifact payload"
                );
                let artifact = probe_payload(&bytes)?;
                self.migrate_inline_row(&row, &bytes).await;
                Ok(Some(artifact))
            }
            None => Err(ServiceError::ArtifactCorrupt(format!(
                "catalog row {} has neither path nor payload",
                row.id
            ))),
        }
    }

    /// Integrity gate: size ceiling plus a full deserialization probe.
    async fn read_and_validate(&self, path: &Path) -> Result<DetectorArtifact, ServiceError> {
        let meta = tokio::fs::metadata(path).await.map_err(|e| {
            ServiceError::ArtifactNotFound(format!("{}: {e}", path.display()))
        })?;
        if meta.len() > self.config.max_artifact_bytes {
            return Err(ServiceError::ArtifactCorrupt(format!(
                "{} is {} bytes, ceiling is {}",
                path.display(),
                meta.len(),
                self.config.max_artifact_bytes
            )));
        }
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ServiceError::ArtifactLoad(format!("{}: {e}", path.display())))?;
        probe_payload(&bytes)
    }

    /// Rewrite a legacy inline row to file-backed storage. Best effort: a
    /// migration failure is logged and the caller keeps the loaded model.
    async fn migrate_inline_row(&self, row: &model_artifact::Model, bytes: &[u8]) {
        let metric_type = match MetricType::from_str(&row.metric_type) {
            Some(mt) => mt,
            None => {
                warn!(row_id = row.id, metric_type = %row.metric_type, "cannot migrate inline artifact with unknown metric type");
                return;
            }
        };
        let path = match self.unique_artifact_path(&row.model_type, metric_type) {
            Ok(p) => p,
            Err(e) => {
                warn!(row_id = row.id, error = %e, "inline artifact migration skipped");
                return;
            }
        };
        if let Err(e) = tokio::fs::write(&path, bytes).await {
            warn!(row_id = row.id, error = %e, "inline artifact migration write failed");
            return;
        }
        restrict_permissions(&path).await;

        let mut update: model_artifact::ActiveModel = row.clone().into();
        update.model_path = Set(Some(path.to_string_lossy().into_owned()));
        update.payload = Set(None);
        match update.update(self.db.as_ref()).await {
            Ok(_) => info!(row_id = row.id, path = %path.display(), "inline artifact migrated to file"),
            Err(e) => {
                warn!(row_id = row.id, error = %e, "inline artifact catalog update failed");
                let _ = tokio::fs::remove_file(&path).await;
            }
        }
    }

    /// Migrate every legacy inline row to file-backed storage. Returns the
    /// number of rows rewritten.
    pub async fn migrate_inline_artifacts(&self) -> Result<usize, ServiceError> {
        let rows = ModelArtifactEntity::find()
            .filter(model_artifact::Column::ModelPath.is_null())
            .filter(model_artifact::Column::Payload.is_not_null())
            .all(self.db.as_ref())
            .await?;

        let mut migrated = 0;
        for row in rows {
            let Some(bytes) = row.payload.clone() else {
                continue;
            };
            if probe_payload(&bytes).is_err() {
                warn!(row_id = row.id, "inline artifact payload corrupt, skipping migration");
                continue;
            }
            self.migrate_inline_row(&row, &bytes).await;
            migrated += 1;
        }
        Ok(migrated)
    }

    /// Retention pass: keep the newest `keep_versions` rows per
    /// (model_type, metric_type), deactivating the rest and deleting their
    /// files; purge inactive rows past the retention age; sweep orphan files
    /// with no catalog row.
    #[instrument(skip(self))]
    pub async fn cleanup(&self, keep_versions: usize) -> Result<CleanupReport, ServiceError> {
        let mut report = CleanupReport::default();

        let all = ModelArtifactEntity::find()
            .order_by_desc(model_artifact::Column::TrainingDate)
            .order_by_desc(model_artifact::Column::Id)
            .all(self.db.as_ref())
            .await?;

        // Group newest-first per key; anything after keep_versions goes.
        let mut keys: Vec<(String, String)> = Vec::new();
        for row in &all {
            let key = (row.model_type.clone(), row.metric_type.clone());
            if !keys.contains(&key) {
                keys.push(key);
            }
        }

        for (model_type, metric_type) in keys {
            let rows: Vec<&model_artifact::Model> = all
                .iter()
                .filter(|r| r.model_type == model_type && r.metric_type == metric_type)
                .collect();

            for (idx, row) in rows.iter().enumerate() {
                if idx < keep_versions {
                    report.kept.push(format!("{model_type}_{metric_type}"));
                    continue;
                }
                self.remove_backing_file(row, &mut report).await;
                let mut update: model_artifact::ActiveModel = (*row).clone().into();
                update.is_active = Set(false);
                update.update(self.db.as_ref()).await?;
            }
        }

        // Inactive rows past the retention age go entirely, file first.
        let cutoff = Utc::now() - ChronoDuration::days(self.config.inactive_retention_days);
        let stale = ModelArtifactEntity::find()
            .filter(model_artifact::Column::IsActive.eq(false))
            .filter(model_artifact::Column::TrainingDate.lt(cutoff))
            .all(self.db.as_ref())
            .await?;
        for row in stale {
            self.remove_backing_file(&row, &mut report).await;
            ModelArtifactEntity::delete_by_id(row.id)
                .exec(self.db.as_ref())
                .await?;
            report.deleted_rows += 1;
        }

        self.sweep_orphan_files(&mut report).await?;

        report.kept.sort();
        report.kept.dedup();

        info!(
            deleted_files = report.deleted_files,
            deleted_rows = report.deleted_rows,
            orphans = report.orphan_files_removed,
            freed_bytes = report.freed_bytes,
            missing = report.missing_backing_files,
            "model store cleanup finished"
        );
        Ok(report)
    }

    async fn remove_backing_file(&self, row: &model_artifact::Model, report: &mut CleanupReport) {
        let Some(path_str) = row.model_path.as_deref() else {
            return;
        };
        let path = match self.resolve_in_root(Path::new(path_str)) {
            Ok(p) => p,
            Err(e) => {
                // A catalog row pointing outside the root is logged loudly
                // but never followed.
                error!(row_id = row.id, path = path_str, error = %e, "refusing to delete file outside store root");
                return;
            }
        };
        match tokio::fs::metadata(&path).await {
            Ok(meta) => {
                if tokio::fs::remove_file(&path).await.is_ok() {
                    report.deleted_files += 1;
                    report.freed_bytes += meta.len();
                }
            }
            Err(_) => {
                // Inconsistency between catalog and disk: logged, not fatal.
                warn!(row_id = row.id, path = path_str, "backing file already missing");
                report.missing_backing_files += 1;
            }
        }
    }

    /// Remove `.bin` files nothing in the catalog references (e.g. leftovers
    /// of a save interrupted between file write and catalog commit).
    async fn sweep_orphan_files(&self, report: &mut CleanupReport) -> Result<(), ServiceError> {
        let referenced: Vec<String> = ModelArtifactEntity::find()
            .all(self.db.as_ref())
            .await?
            .into_iter()
            .filter_map(|r| r.model_path)
            .collect();

        let Ok(mut entries) = tokio::fs::read_dir(&self.root).await else {
            return Ok(());
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("bin") {
                continue;
            }
            let path_str = path.to_string_lossy();
            if referenced.iter().any(|r| r.as_str() == path_str) {
                continue;
            }
            if let Ok(meta) = entry.metadata().await {
                if tokio::fs::remove_file(&path).await.is_ok() {
                    warn!(path = %path.display(), "removed orphaned artifact file");
                    report.orphan_files_removed += 1;
                    report.freed_bytes += meta.len();
                }
            }
        }
        Ok(())
    }

    /// All active artifacts, newest first.
    pub async fn list(&self) -> Result<Vec<ModelInfo>, ServiceError> {
        let rows = ModelArtifactEntity::find()
            .filter(model_artifact::Column::IsActive.eq(true))
            .order_by_desc(model_artifact::Column::TrainingDate)
            .all(self.db.as_ref())
            .await?;
        Ok(rows.into_iter().map(|r| self.project(r)).collect())
    }

    /// The active artifact for a key, if any.
    pub async fn info(
        &self,
        model_type: &str,
        metric_type: MetricType,
    ) -> Result<Option<ModelInfo>, ServiceError> {
        let row = ModelArtifactEntity::find()
            .filter(model_artifact::Column::ModelType.eq(model_type))
            .filter(model_artifact::Column::MetricType.eq(metric_type.as_str()))
            .filter(model_artifact::Column::IsActive.eq(true))
            .one(self.db.as_ref())
            .await?;
        Ok(row.map(|r| self.project(r)))
    }

    fn project(&self, row: model_artifact::Model) -> ModelInfo {
        let size_bytes = row
            .model_path
            .as_deref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0);
        ModelInfo {
            id: row.id,
            model_type: row.model_type,
            metric_type: row.metric_type,
            path: row.model_path,
            size_bytes,
            accuracy: row.accuracy,
            precision: row.precision,
            recall: row.recall,
            training_date: row.training_date,
            is_active: row.is_active,
        }
    }

    /// Persist an operation sample as a system metric row. Failures here are
    /// logged and swallowed so telemetry can never fail the operation.
    async fn record_store_op(
        &self,
        operation: &str,
        model_type: &str,
        metric_type: MetricType,
        duration_ms: f64,
        size_bytes: u64,
        success: bool,
        error_message: Option<&str>,
    ) {
        let row = metric::ActiveModel {
            metric_type: Set(MetricType::StoreOpDuration.as_str().to_string()),
            entity_kind: Set(EntityKind::System.as_str().to_string()),
            entity_id: Set(0),
            value: Set(duration_ms),
            timestamp: Set(Utc::now()),
            extra: Set(Some(json!({
                "operation": operation,
                "model_type": model_type,
                "metric_type": metric_type.as_str(),
                "size_bytes": size_bytes,
                "success": success,
                "error": error_message,
            }))),
            ..Default::default()
        };
        if let Err(e) = row.insert(self.db.as_ref()).await {
            warn!(error = %e, "failed to record store operation sample");
        }
    }

    /// Aggregate save/load samples over the trailing window.
    pub async fn performance_stats(&self, hours: i64) -> Result<PerformanceStats, ServiceError> {
        let cutoff = Utc::now() - ChronoDuration::hours(hours);
        let rows = metric::Entity::find()
            .filter(metric::Column::MetricType.eq(MetricType::StoreOpDuration.as_str()))
            .filter(metric::Column::Timestamp.gte(cutoff))
            .all(self.db.as_ref())
            .await?;

        let mut save_samples: Vec<(f64, bool)> = Vec::new();
        let mut load_samples: Vec<(f64, bool)> = Vec::new();
        for row in rows {
            let Some(extra) = row.extra.as_ref() else {
                continue;
            };
            let success = extra
                .get("success")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            match extra.get("operation").and_then(|v| v.as_str()) {
                Some("model_save") => save_samples.push((row.value, success)),
                Some("model_load") => load_samples.push((row.value, success)),
                _ => {}
            }
        }

        Ok(PerformanceStats {
            period_hours: hours,
            save: op_stats(&save_samples),
            load: op_stats(&load_samples),
            usage: self.usage(),
        })
    }
}

fn op_stats(samples: &[(f64, bool)]) -> OpStats {
    if samples.is_empty() {
        return OpStats::default();
    }
    let count = samples.len() as u64;
    let success = samples.iter().filter(|(_, ok)| *ok).count() as u64;
    let mut durations: Vec<f64> = samples.iter().map(|(ms, _)| *ms).collect();
    durations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let avg = durations.iter().sum::<f64>() / durations.len() as f64;
    OpStats {
        count,
        success,
        fail: count - success,
        success_rate: success as f64 / count as f64 * 100.0,
        avg_ms: avg,
        p50_ms: durations[durations.len() / 2],
    }
}

fn probe_payload(bytes: &[u8]) -> Result<DetectorArtifact, ServiceError> {
    let artifact: DetectorArtifact = serde_json::from_slice(bytes)
        .map_err(|e| ServiceError::ArtifactCorrupt(format!("deserialization probe failed: {e}")))?;
    if artifact.schema_version != ARTIFACT_SCHEMA_VERSION {
        return Err(ServiceError::ArtifactCorrupt(format!(
            "unsupported artifact schema version {}",
            artifact.schema_version
        )));
    }
    Ok(artifact)
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) =
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
    {
        warn!(path = %path.display(), error = %e, "failed to restrict artifact permissions");
    }
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) {}
