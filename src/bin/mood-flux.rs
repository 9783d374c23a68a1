//! Mood Flux CLI - Batch entry points for the mood pipeline
//!
//! Commands:
//! - init-db: Apply the schema migrations
//! - train: Fit a model on all daily features and commit the run
//! - score: Score the trailing window with a stored model
//! - aggregate: Build daily feature rows for one day
//! - run: aggregate then train
//! - doctor: Diagnose configuration and store connectivity
//!
//! Connection and tuning parameters come from the environment; results are
//! printed to stdout as JSON, logs and errors go to stderr.

use std::io;
use std::process::ExitCode;
use std::time::Duration;

use chrono::{Duration as Days, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mood_flux::config::{DEFAULT_AGGREGATION_WORKERS, DEFAULT_LAMBDA, DEFAULT_WINDOW_DAYS};
use mood_flux::store::{ModelRegistry, PgStore};
use mood_flux::{CountPolicy, MoodPipeline, PipelineConfig, PipelineError};
use mood_flux::{FLUX_VERSION, PRODUCER_NAME};

/// Mood Flux - Daily behavioral features and mood models
#[derive(Parser)]
#[command(name = "mood-flux")]
#[command(author = "Synheart AI Inc")]
#[command(version = FLUX_VERSION)]
#[command(about = "Aggregate behavioral features and train mood models", long_about = None)]
struct Cli {
    /// Postgres connection string
    #[arg(long, global = true, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// Ridge penalty
    #[arg(long, global = true, env = "MOOD_FLUX_LAMBDA", default_value_t = DEFAULT_LAMBDA)]
    lambda: f64,

    /// Trailing window scored after training, in days
    #[arg(long, global = true, env = "MOOD_FLUX_WINDOW_DAYS", default_value_t = DEFAULT_WINDOW_DAYS)]
    window_days: i64,

    /// Users aggregated concurrently
    #[arg(long, global = true, env = "MOOD_FLUX_WORKERS", default_value_t = DEFAULT_AGGREGATION_WORKERS)]
    workers: usize,

    /// Per-call store timeout in seconds (0 disables)
    #[arg(long, global = true, env = "MOOD_FLUX_STORE_TIMEOUT_SECS", default_value_t = 30)]
    store_timeout_secs: u64,

    /// Maximum pooled database connections
    #[arg(long, global = true, env = "MOOD_FLUX_MAX_CONNECTIONS", default_value_t = 5)]
    max_connections: u32,

    /// Report zero counts as 0 instead of null when events were seen
    #[arg(long, global = true, env = "MOOD_FLUX_KEEP_ZERO_COUNTS")]
    keep_zero_counts: bool,

    /// Skip scoring rows with fewer present features
    #[arg(long, global = true, env = "MOOD_FLUX_MIN_FEATURES", default_value_t = 0)]
    min_features: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the schema migrations
    InitDb,

    /// Train a model on all daily features and commit the run
    Train,

    /// Score the trailing window with a stored model
    Score {
        /// Model version (defaults to the latest)
        #[arg(long)]
        model_version: Option<String>,
    },

    /// Build daily feature rows for every user active on a day
    Aggregate {
        /// UTC day, YYYY-MM-DD (defaults to yesterday)
        #[arg(long)]
        day: Option<NaiveDate>,
    },

    /// Aggregate a day, then train
    Run {
        /// UTC day, YYYY-MM-DD (defaults to yesterday)
        #[arg(long)]
        day: Option<NaiveDate>,
    },

    /// Diagnose configuration and store connectivity
    Doctor,
}

impl Cli {
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            lambda: self.lambda,
            window_days: self.window_days,
            aggregation_workers: self.workers,
            store_timeout: (self.store_timeout_secs > 0)
                .then(|| Duration::from_secs(self.store_timeout_secs)),
            count_policy: if self.keep_zero_counts {
                CountPolicy::KeepZero
            } else {
                CountPolicy::CollapseZero
            },
            min_features_present: self.min_features,
        }
    }

    async fn connect(&self) -> Result<PgStore, FluxCliError> {
        let url = self
            .database_url
            .as_deref()
            .ok_or(FluxCliError::MissingDatabaseUrl)?;
        Ok(PgStore::connect(url, self.max_connections).await?)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), FluxCliError> {
    let config = cli.pipeline_config();

    match &cli.command {
        Commands::InitDb => {
            cli.connect().await?.migrate().await?;
            println!("{}", serde_json::json!({ "migrated": true }));
        }

        Commands::Train => {
            let store = cli.connect().await?;
            let report = MoodPipeline::new(&store, config)?.train().await?;
            println!("{}", serde_json::to_string(&report)?);
        }

        Commands::Score { model_version } => {
            let store = cli.connect().await?;
            let report = MoodPipeline::new(&store, config)?
                .score(model_version.as_deref())
                .await?;
            println!("{}", serde_json::to_string(&report)?);
        }

        Commands::Aggregate { day } => {
            let store = cli.connect().await?;
            let report = MoodPipeline::new(&store, config)?
                .aggregate_day(day.unwrap_or_else(yesterday))
                .await?;
            println!("{}", serde_json::to_string(&report)?);
        }

        Commands::Run { day } => {
            let store = cli.connect().await?;
            let report = MoodPipeline::new(&store, config)?
                .run(day.unwrap_or_else(yesterday))
                .await?;
            println!("{}", serde_json::to_string(&report)?);
        }

        Commands::Doctor => cmd_doctor(&cli).await?,
    }

    Ok(())
}

fn yesterday() -> NaiveDate {
    Utc::now().date_naive() - Days::days(1)
}

async fn cmd_doctor(cli: &Cli) -> Result<(), FluxCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "flux_version".to_string(),
        status: CheckStatus::Ok,
        message: format!("Mood Flux version {}", FLUX_VERSION),
    });

    let config = cli.pipeline_config();
    checks.push(match config.validate() {
        Ok(()) => DoctorCheck {
            name: "config".to_string(),
            status: CheckStatus::Ok,
            message: format!(
                "lambda={} window_days={} workers={}",
                config.lambda, config.window_days, config.aggregation_workers
            ),
        },
        Err(e) => DoctorCheck {
            name: "config".to_string(),
            status: CheckStatus::Error,
            message: e.to_string(),
        },
    });

    match cli.connect().await {
        Ok(store) => {
            checks.push(match store.ping().await {
                Ok(()) => DoctorCheck {
                    name: "database".to_string(),
                    status: CheckStatus::Ok,
                    message: "Connected to Postgres".to_string(),
                },
                Err(e) => DoctorCheck {
                    name: "database".to_string(),
                    status: CheckStatus::Error,
                    message: e.to_string(),
                },
            });

            checks.push(match store.latest_model().await {
                Ok(Some(model)) => DoctorCheck {
                    name: "latest_model".to_string(),
                    status: CheckStatus::Ok,
                    message: format!(
                        "{} (train_mae {:.3}, created {})",
                        model.model_version, model.train_mae, model.created_at
                    ),
                },
                Ok(None) => DoctorCheck {
                    name: "latest_model".to_string(),
                    status: CheckStatus::Warning,
                    message: "No trained model in the registry".to_string(),
                },
                Err(e) => DoctorCheck {
                    name: "latest_model".to_string(),
                    status: CheckStatus::Error,
                    message: e.to_string(),
                },
            });
        }
        Err(e) => checks.push(DoctorCheck {
            name: "database".to_string(),
            status: CheckStatus::Error,
            message: CliError::from(e).message,
        }),
    }

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: FLUX_VERSION.to_string(),
        checks,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    let has_errors = report
        .checks
        .iter()
        .any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(FluxCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

// Error types

#[derive(Debug)]
enum FluxCliError {
    Pipeline(PipelineError),
    Json(serde_json::Error),
    MissingDatabaseUrl,
    DoctorFailed,
}

impl From<PipelineError> for FluxCliError {
    fn from(e: PipelineError) -> Self {
        FluxCliError::Pipeline(e)
    }
}

impl From<serde_json::Error> for FluxCliError {
    fn from(e: serde_json::Error) -> Self {
        FluxCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<FluxCliError> for CliError {
    fn from(e: FluxCliError) -> Self {
        match e {
            FluxCliError::Pipeline(e) => {
                let (code, hint) = match &e {
                    PipelineError::EmptyDesignMatrix
                    | PipelineError::InsufficientTrainingData { .. } => (
                        "INSUFFICIENT_DATA",
                        Some("Aggregate more labeled days before training"),
                    ),
                    PipelineError::Repository(_) => {
                        ("REPOSITORY_ERROR", Some("Check the database schema and connectivity"))
                    }
                    PipelineError::VersionConflict(_) => (
                        "VERSION_CONFLICT",
                        Some("Another training run claimed every candidate version; retry"),
                    ),
                    PipelineError::ModelNotFound(_) => {
                        ("MODEL_NOT_FOUND", Some("Run 'mood-flux train' first"))
                    }
                    PipelineError::Timeout { .. } => (
                        "TIMEOUT",
                        Some("Raise MOOD_FLUX_STORE_TIMEOUT_SECS or check database load"),
                    ),
                    PipelineError::InvalidConfig(_) => {
                        ("CONFIG_ERROR", Some("Run 'mood-flux doctor' for details"))
                    }
                    PipelineError::DimensionMismatch { .. } | PipelineError::Json(_) => {
                        ("INTERNAL_ERROR", None)
                    }
                };
                CliError {
                    code: code.to_string(),
                    message: e.to_string(),
                    hint: hint.map(str::to_string),
                }
            }
            FluxCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            FluxCliError::MissingDatabaseUrl => CliError {
                code: "MISSING_DATABASE_URL".to_string(),
                message: "DATABASE_URL is not set".to_string(),
                hint: Some("Export DATABASE_URL or pass --database-url".to_string()),
            },
            FluxCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
