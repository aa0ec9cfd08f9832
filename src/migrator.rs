use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240301_000001_create_metrics_table::Migration),
            Box::new(m20240301_000002_create_alerts_table::Migration),
            Box::new(m20240301_000003_create_model_artifacts_table::Migration),
        ]
    }
}

// Migration implementations

mod m20240301_000001_create_metrics_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000001_create_metrics_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Metrics::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Metrics::Id)
                                .big_integer()
                                .primary_key()
                                .auto_increment()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Metrics::MetricType).string().not_null())
                        .col(ColumnDef::new(Metrics::EntityKind).string().not_null())
                        .col(
                            ColumnDef::new(Metrics::EntityId)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Metrics::Value).double().not_null())
                        .col(ColumnDef::new(Metrics::Timestamp).timestamp().not_null())
                        .col(ColumnDef::new(Metrics::Extra).json().null())
                        .to_owned(),
                )
                .await?;

            // Series reads always filter (metric_type, entity_id) and order
            // by timestamp; one composite index covers the whole access path.
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_metrics_series")
                        .table(Metrics::Table)
                        .col(Metrics::MetricType)
                        .col(Metrics::EntityId)
                        .col(Metrics::Timestamp)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_metrics_timestamp")
                        .table(Metrics::Table)
                        .col(Metrics::Timestamp)
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Metrics::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    enum Metrics {
        Table,
        Id,
        MetricType,
        EntityKind,
        EntityId,
        Value,
        Timestamp,
        Extra,
    }
}

mod m20240301_000002_create_alerts_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000002_create_alerts_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Alerts::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Alerts::Id)
                                .big_integer()
                                .primary_key()
                                .auto_increment()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Alerts::AlertType).string().not_null())
                        .col(ColumnDef::new(Alerts::Severity).string().not_null())
                        .col(ColumnDef::new(Alerts::EntityKind).string().not_null())
                        .col(
                            ColumnDef::new(Alerts::EntityId)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Alerts::MetricValue).double().not_null())
                        .col(ColumnDef::new(Alerts::ExpectedValue).double().not_null())
                        .col(
                            ColumnDef::new(Alerts::DeviationPercent)
                                .double()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Alerts::Message).string().not_null())
                        .col(ColumnDef::new(Alerts::SuggestedAction).string().null())
                        .col(
                            ColumnDef::new(Alerts::IsRead)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Alerts::IsFalsePositive)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(ColumnDef::new(Alerts::ResolvedAt).timestamp().null())
                        .col(ColumnDef::new(Alerts::ResolvedBy).string().null())
                        .col(ColumnDef::new(Alerts::CreatedAt).timestamp().not_null())
                        .to_owned(),
                )
                .await?;

            // Dedup guard: lookups by (alert_type, entity_id) inside a window.
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_alerts_dedup")
                        .table(Alerts::Table)
                        .col(Alerts::AlertType)
                        .col(Alerts::EntityId)
                        .col(Alerts::CreatedAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_alerts_unread")
                        .table(Alerts::Table)
                        .col(Alerts::IsRead)
                        .col(Alerts::IsFalsePositive)
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Alerts::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    enum Alerts {
        Table,
        Id,
        AlertType,
        Severity,
        EntityKind,
        EntityId,
        MetricValue,
        ExpectedValue,
        DeviationPercent,
        Message,
        SuggestedAction,
        IsRead,
        IsFalsePositive,
        ResolvedAt,
        ResolvedBy,
        CreatedAt,
    }
}

mod m20240301_000003_create_model_artifacts_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000003_create_model_artifacts_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(ModelArtifacts::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ModelArtifacts::Id)
                                .big_integer()
                                .primary_key()
                                .auto_increment()
                                .not_null(),
                        )
                        .col(ColumnDef::new(ModelArtifacts::ModelType).string().not_null())
                        .col(
                            ColumnDef::new(ModelArtifacts::MetricType)
                                .string()
                                .not_null(),
                        )
                        .col(ColumnDef::new(ModelArtifacts::ModelPath).string().null())
                        .col(ColumnDef::new(ModelArtifacts::Payload).binary().null())
                        .col(ColumnDef::new(ModelArtifacts::Parameters).json().not_null())
                        .col(
                            ColumnDef::new(ModelArtifacts::TrainingDate)
                                .timestamp()
                                .not_null(),
                        )
                        .col(ColumnDef::new(ModelArtifacts::Accuracy).double().null())
                        .col(ColumnDef::new(ModelArtifacts::Precision).double().null())
                        .col(ColumnDef::new(ModelArtifacts::Recall).double().null())
                        .col(
                            ColumnDef::new(ModelArtifacts::IsActive)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(ModelArtifacts::CreatedAt)
                                .timestamp()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_model_artifacts_key")
                        .table(ModelArtifacts::Table)
                        .col(ModelArtifacts::ModelType)
                        .col(ModelArtifacts::MetricType)
                        .col(ModelArtifacts::IsActive)
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(ModelArtifacts::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    enum ModelArtifacts {
        Table,
        Id,
        ModelType,
        MetricType,
        ModelPath,
        Payload,
        Parameters,
        TrainingDate,
        Accuracy,
        Precision,
        Recall,
        IsActive,
        CreatedAt,
    }
}
