use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Serialize;

use stockwatch::{
    config::{self, AppConfig},
    db,
    entities::alert::Severity,
    entities::metric::MetricType,
    errors::ServiceError,
    logging,
    services::collector::{
        CustodyObservation, EntityObservation, LedgerTransaction, MetricSource, StockObservation,
    },
    services::monitor::Monitor,
    services::notifications::LogSink,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let context = CliContext::initialize().await?;

    match cli.command {
        Commands::Collect => handle_collect(&context, cli.json).await?,
        Commands::Detect => handle_detect(&context, cli.json).await?,
        Commands::Train => handle_train(&context, cli.json).await?,
        Commands::Alerts(command) => handle_alerts_command(&context, command, cli.json).await?,
        Commands::Models(command) => handle_models_command(&context, command, cli.json).await?,
        Commands::Health(args) => handle_health(&context, args, cli.json).await?,
        Commands::Cleanup(args) => handle_cleanup(&context, args, cli.json).await?,
    }

    Ok(())
}

#[derive(Parser)]
#[command(
    name = "stockwatch",
    about = "Stockwatch CLI driving the scheduled collection, detection, and maintenance passes",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sample business state into new metric rows
    Collect,
    /// Run every anomaly-detection category once
    Detect,
    /// Train detector models for the model-backed metric families
    Train,
    #[command(subcommand)]
    Alerts(AlertsCommands),
    #[command(subcommand)]
    Models(ModelsCommands),
    /// Report fallback health and model-store performance
    Health(HealthArgs),
    /// Purge read alerts, old metrics, and surplus model versions
    Cleanup(CleanupArgs),
}

#[derive(Subcommand)]
enum AlertsCommands {
    List(ListAlertsArgs),
    Read(AlertActionArgs),
    /// Mark an alert as a false positive (terminal)
    Dismiss(AlertActionArgs),
}

#[derive(Args)]
struct ListAlertsArgs {
    #[arg(long, value_parser = parse_severity, help = "Filter by severity (low|medium|high|critical)")]
    severity: Option<Severity>,
    #[arg(long, help = "Maximum number of alerts to print")]
    limit: Option<usize>,
}

#[derive(Args)]
struct AlertActionArgs {
    #[arg(long, help = "Alert identifier")]
    id: i64,
    #[arg(long, default_value = "cli", help = "Actor recorded on the transition")]
    actor: String,
}

#[derive(Subcommand)]
enum ModelsCommands {
    List,
    Info(ModelInfoArgs),
    Cleanup(ModelsCleanupArgs),
}

#[derive(Args)]
struct ModelInfoArgs {
    #[arg(long, default_value = "isolation_forest", help = "Model family")]
    model_type: String,
    #[arg(long, value_parser = parse_metric_type, help = "Metric type the model scores")]
    metric_type: MetricType,
}

#[derive(Args)]
struct ModelsCleanupArgs {
    #[arg(long, default_value_t = 3, help = "Versions to retain per (model_type, metric_type)")]
    keep_versions: usize,
}

#[derive(Args)]
struct HealthArgs {
    #[arg(long, default_value_t = 24, help = "Store performance window, hours")]
    hours: i64,
}

#[derive(Args)]
struct CleanupArgs {
    #[arg(long, help = "Model versions to retain; defaults to the configured value")]
    keep_versions: Option<usize>,
}

struct CliContext {
    monitor: Monitor,
}

impl CliContext {
    async fn initialize() -> Result<Self> {
        let config: AppConfig =
            config::load_config().context("failed to load application config")?;
        logging::init(&config);

        let pool = db::connect_from_config(&config)
            .await
            .context("failed to connect to database")?;
        let db = Arc::new(pool);

        // The CLI runs standalone: business-state lookups come back empty and
        // notifications go to the log. Deployments embed the crate with real
        // collaborators instead.
        let monitor = Monitor::new(db, Arc::new(EmptySource), Arc::new(LogSink), config)
            .context("failed to assemble services")?;
        Ok(Self { monitor })
    }
}

/// Placeholder business-state source for standalone CLI runs.
struct EmptySource;

#[async_trait::async_trait]
impl MetricSource for EmptySource {
    async fn stock_levels(&self) -> Result<Vec<StockObservation>, ServiceError> {
        Ok(Vec::new())
    }
    async fn room_consumption_24h(&self) -> Result<Vec<EntityObservation>, ServiceError> {
        Ok(Vec::new())
    }
    async fn task_completion_intervals(&self) -> Result<Vec<EntityObservation>, ServiceError> {
        Ok(Vec::new())
    }
    async fn custody_positions(&self) -> Result<Vec<CustodyObservation>, ServiceError> {
        Ok(Vec::new())
    }
    async fn vacant_room_consumption_24h(&self) -> Result<Vec<EntityObservation>, ServiceError> {
        Ok(Vec::new())
    }
    async fn fulfillment_delays(&self) -> Result<Vec<EntityObservation>, ServiceError> {
        Ok(Vec::new())
    }
    async fn scan_counts_24h(&self) -> Result<Vec<EntityObservation>, ServiceError> {
        Ok(Vec::new())
    }
    async fn transactions_since(
        &self,
        _cutoff: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<LedgerTransaction>, ServiceError> {
        Ok(Vec::new())
    }
}

async fn handle_collect(context: &CliContext, json: bool) -> Result<()> {
    let report = context
        .monitor
        .run_collection()
        .await
        .context("collection pass failed")?;
    if json {
        print_json(&report)?;
    } else {
        println!(
            "Collected {} metric(s), {} skipped, {} failure(s){}",
            report.written,
            report.skipped,
            report.failures,
            if report.truncated { " (truncated)" } else { "" }
        );
        for (category, written) in &report.by_category {
            println!("  {category}: {written}");
        }
    }
    Ok(())
}

async fn handle_detect(context: &CliContext, json: bool) -> Result<()> {
    let report = context
        .monitor
        .run_detection_pass()
        .await
        .context("detection pass failed")?;
    if json {
        print_json(&report)?;
    } else {
        println!(
            "Detection pass created {} alert(s){}",
            report.total,
            if report.truncated { " (truncated)" } else { "" }
        );
        for (category, created) in &report.alerts_by_category {
            println!("  {category}: {created}");
        }
    }
    Ok(())
}

async fn handle_train(context: &CliContext, json: bool) -> Result<()> {
    let summary = context.monitor.train_models().await;
    if json {
        print_json(&summary)?;
    } else {
        for outcome in &summary.trained {
            println!(
                "Trained {} on {} point(s), accuracy {:.2} -> {}",
                outcome.metric_type, outcome.data_points, outcome.accuracy, outcome.path
            );
        }
        for metric_type in &summary.skipped {
            println!("Skipped {metric_type}: not enough data");
        }
        for metric_type in &summary.failed {
            println!("Failed {metric_type}: see logs");
        }
        if summary.trained.is_empty() && summary.failed.is_empty() {
            println!("No models trained.");
        }
    }
    Ok(())
}

async fn handle_alerts_command(
    context: &CliContext,
    command: AlertsCommands,
    json: bool,
) -> Result<()> {
    match command {
        AlertsCommands::List(args) => {
            let alerts = context
                .monitor
                .list_active_alerts(args.severity, args.limit)
                .await
                .context("failed to list alerts")?;
            if json {
                print_json(&alerts)?;
            } else if alerts.is_empty() {
                println!("No active alerts.");
            } else {
                println!("Active alerts ({} total):", alerts.len());
                for alert in &alerts {
                    println!(
                        "- #{} [{}] {} • {} {} • {}",
                        alert.id,
                        alert.severity.to_uppercase(),
                        alert.alert_type,
                        alert.entity_kind,
                        alert.entity_id,
                        alert.message
                    );
                }
            }
            Ok(())
        }
        AlertsCommands::Read(args) => {
            let updated = context
                .monitor
                .mark_read(args.id, &args.actor)
                .await
                .with_context(|| format!("failed to mark alert {} read", args.id))?;
            if updated {
                println!("Alert {} marked read", args.id);
            } else {
                return Err(anyhow!("alert {} not found", args.id));
            }
            Ok(())
        }
        AlertsCommands::Dismiss(args) => {
            let updated = context
                .monitor
                .mark_false_positive(args.id, &args.actor)
                .await
                .with_context(|| format!("failed to dismiss alert {}", args.id))?;
            if updated {
                println!("Alert {} dismissed as false positive", args.id);
            } else {
                return Err(anyhow!("alert {} not found", args.id));
            }
            Ok(())
        }
    }
}

async fn handle_models_command(
    context: &CliContext,
    command: ModelsCommands,
    json: bool,
) -> Result<()> {
    match command {
        ModelsCommands::List => {
            let models = context
                .monitor
                .list_models()
                .await
                .context("failed to list models")?;
            if json {
                print_json(&models)?;
            } else if models.is_empty() {
                println!("No active models.");
            } else {
                for model in &models {
                    println!(
                        "- {} / {} • trained {} • {} bytes • accuracy {}",
                        model.model_type,
                        model.metric_type,
                        model.training_date.format("%Y-%m-%d %H:%M"),
                        model.size_bytes,
                        model
                            .accuracy
                            .map(|a| format!("{a:.2}"))
                            .unwrap_or_else(|| "n/a".to_string())
                    );
                }
            }
            Ok(())
        }
        ModelsCommands::Info(args) => {
            let info = context
                .monitor
                .model_info(&args.model_type, args.metric_type)
                .await
                .context("failed to fetch model info")?
                .ok_or_else(|| {
                    anyhow!(
                        "no active model for {} / {}",
                        args.model_type,
                        args.metric_type
                    )
                })?;
            if json {
                print_json(&info)?;
            } else {
                println!("Model {} / {}", info.model_type, info.metric_type);
                println!("  trained: {}", info.training_date.to_rfc3339());
                println!("  path: {}", info.path.as_deref().unwrap_or("(inline)"));
                println!("  size: {} bytes", info.size_bytes);
                println!(
                    "  accuracy/precision/recall: {:?} / {:?} / {:?}",
                    info.accuracy, info.precision, info.recall
                );
            }
            Ok(())
        }
        ModelsCommands::Cleanup(args) => {
            let report = context
                .monitor
                .cleanup_models(args.keep_versions)
                .await
                .context("model cleanup failed")?;
            if json {
                print_json(&report)?;
            } else {
                println!(
                    "Removed {} file(s) and {} row(s), {} orphan(s), freed {} bytes",
                    report.deleted_files,
                    report.deleted_rows,
                    report.orphan_files_removed,
                    report.freed_bytes
                );
            }
            Ok(())
        }
    }
}

async fn handle_health(context: &CliContext, args: HealthArgs, json: bool) -> Result<()> {
    let health = context.monitor.fallback_health().await;
    let performance = context
        .monitor
        .store_performance(args.hours)
        .await
        .context("failed to aggregate store performance")?;

    if json {
        print_json(&serde_json::json!({
            "fallback": health,
            "store": performance,
        }))?;
    } else {
        println!(
            "Fallback health: {} ({} of {} attempts fell back, rate {:.0}%)",
            health.status.as_str(),
            health.fallback_count,
            health.total,
            health.fallback_rate * 100.0
        );
        println!(
            "  causes: missing {} / corrupt {} / load {} / inference {}",
            health.missing_artifact,
            health.corrupt_artifact,
            health.load_error,
            health.inference_error
        );
        println!(
            "Model store: {} save(s), {} load(s) over {}h, {:.1}% of quota used",
            performance.save.count, performance.load.count, args.hours, performance.usage.percent
        );
    }
    Ok(())
}

async fn handle_cleanup(context: &CliContext, args: CleanupArgs, json: bool) -> Result<()> {
    let summary = context
        .monitor
        .run_cleanup(args.keep_versions)
        .await
        .context("cleanup pass failed")?;
    if json {
        print_json(&summary)?;
    } else {
        println!(
            "Deleted {} alert(s), {} metric(s); model store freed {} bytes",
            summary.alerts_deleted, summary.metrics_deleted, summary.models.freed_bytes
        );
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_severity(raw: &str) -> Result<Severity, String> {
    Severity::from_str(raw).ok_or_else(|| format!("invalid severity '{raw}'"))
}

fn parse_metric_type(raw: &str) -> Result<MetricType, String> {
    MetricType::from_str(raw).ok_or_else(|| format!("invalid metric type '{raw}'"))
}
