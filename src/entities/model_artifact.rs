use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, ActiveValue, Set};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Catalog row for a trained detector version.
///
/// Exactly one row per (model_type, metric_type) may have `is_active = true`;
/// the model store enforces this transactionally on save. `model_path` and
/// `payload` are mutually exclusive: file-backed artifacts carry a path,
/// legacy rows carry the serialized payload inline and are migrated to
/// file-backed storage the first time they are loaded.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "model_artifacts")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub model_type: String,
    pub metric_type: String,
    pub model_path: Option<String>,
    /// Legacy inline payload. New saves always write `model_path` instead.
    pub payload: Option<Vec<u8>>,
    pub parameters: Json,
    pub training_date: DateTime<Utc>,
    pub accuracy: Option<f64>,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C: ConnectionTrait>(self, _db: &C, _insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        if let ActiveValue::NotSet = active_model.created_at {
            active_model.created_at = Set(Utc::now());
        }
        Ok(active_model)
    }
}

/// Where an artifact's serialized bytes live, resolved once at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
    FileBacked(PathBuf),
    Inline(Vec<u8>),
}

impl Model {
    /// Resolve the storage variant for this row. Rows with neither a path nor
    /// a payload are unloadable and yield `None`.
    pub fn source(&self) -> Option<ArtifactSource> {
        if let Some(path) = self.model_path.as_deref() {
            return Some(ArtifactSource::FileBacked(PathBuf::from(path)));
        }
        self.payload
            .as_ref()
            .map(|bytes| ArtifactSource::Inline(bytes.clone()))
    }
}
