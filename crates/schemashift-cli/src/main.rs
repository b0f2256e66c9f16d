//! schemashift CLI - SQL Server to PostgreSQL schema and data migration.

use clap::{Parser, Subcommand};
use schemashift::{
    Config, IdentifierTranslator, MigrateError, MigrationOptions, MigrationReport, Orchestrator,
    RunStatus, TableFilter, ViewTranslator,
};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "schemashift")]
#[command(about = "SQL Server to PostgreSQL schema and data migration")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: error, warn, info, debug, trace (RUST_LOG takes precedence)
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Print progress events as JSON lines to stderr
    #[arg(long)]
    progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a migration
    Run {
        /// File listing the tables to migrate, one per line
        #[arg(long)]
        tables_file: Option<PathBuf>,

        /// JSON identifier translation dictionary
        #[arg(long)]
        translations_file: Option<PathBuf>,

        /// Drop target tables before creating them
        #[arg(long)]
        drop_existing: bool,

        /// Rows per insert batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Comma-separated source schemas
        #[arg(long, value_delimiter = ',')]
        schemas: Option<Vec<String>>,

        /// Override number of workers
        #[arg(long)]
        workers: Option<usize>,

        /// Write the run report to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Read the source and print the migration plan without writing anything
    Plan {
        /// File listing the tables to include, one per line
        #[arg(long)]
        tables_file: Option<PathBuf>,

        /// JSON identifier translation dictionary
        #[arg(long)]
        translations_file: Option<PathBuf>,
    },

    /// Translate a T-SQL view definition to PostgreSQL (no database needed)
    TranslateView {
        /// File holding the view SQL; stdin when omitted
        #[arg(long)]
        file: Option<PathBuf>,

        /// JSON identifier translation dictionary
        #[arg(long)]
        translations_file: Option<PathBuf>,
    },

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    // Offline; no config file involved
    if let Commands::TranslateView {
        file,
        translations_file,
    } = &cli.command
    {
        return translate_view(file.as_deref(), translations_file.as_deref(), cli.output_json);
    }

    let mut config = Config::load(&cli.config)?.with_auto_tuning();
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::TranslateView { .. } => unreachable!(), // Handled above
        Commands::Run {
            tables_file,
            translations_file,
            drop_existing,
            batch_size,
            schemas,
            workers,
            report,
        } => {
            // Apply overrides
            if let Some(path) = tables_file {
                config.migration.tables_file = Some(path);
            }
            if let Some(path) = translations_file {
                config.migration.translations_file = Some(path);
            }
            if drop_existing {
                config.migration.drop_existing = true;
            }
            if let Some(size) = batch_size {
                config.migration.batch_size = size;
            }
            if let Some(schemas) = schemas {
                config.migration.schemas = schemas;
            }
            if let Some(w) = workers {
                config.migration.workers = Some(w);
            }
            if let Some(path) = report {
                config.migration.report_file = Some(path);
            }
            config.validate()?;

            let options = MigrationOptions::from_config(&config.migration)?;
            let orchestrator = Orchestrator::new(config).await?;
            let handle = orchestrator.start_migration(options);
            info!("Started run {}", handle.run_id);

            setup_signal_handler(handle.cancel_token());

            if cli.progress {
                let mut events = handle.subscribe();
                tokio::spawn(async move {
                    while let Ok(event) = events.recv().await {
                        if let Ok(line) = serde_json::to_string(&event) {
                            eprintln!("{}", line);
                        }
                    }
                });
            }

            let result = handle.wait().await?;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                print_summary(&result);
            }

            if result.status == RunStatus::Cancelled {
                return Ok(ExitCode::from(MigrateError::Cancelled.exit_code()));
            }
        }

        Commands::Plan {
            tables_file,
            translations_file,
        } => {
            if let Some(path) = translations_file {
                config.migration.translations_file = Some(path);
            }
            let mut options = MigrationOptions::from_config(&config.migration)?;
            if let Some(path) = tables_file {
                options.tables = Some(TableFilter::load(path)?);
            }

            let orchestrator = Orchestrator::new(config).await?;
            let plan = orchestrator.plan(&options).await?;

            if cli.output_json {
                println!("{}", plan.to_json()?);
            } else {
                println!("Migration plan ({} tables):", plan.tables.len());
                for (i, table) in plan.tables.iter().enumerate() {
                    println!(
                        "\n{:>3}. {} -> {} (~{} rows)",
                        i + 1,
                        table.name(),
                        table.target_qualified(),
                        table.row_estimate
                    );
                    println!("{}", table.ddl);
                }
                for cycle in &plan.resolution.cycles {
                    println!("\nCycle: {}", cycle.message);
                }
                for warning in &plan.warnings {
                    match &warning.column {
                        Some(column) => {
                            println!("Warning: {}.{}: {}", warning.table, column, warning.message)
                        }
                        None => println!("Warning: {}: {}", warning.table, warning.message),
                    }
                }
            }
        }

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::new(config).await?;
            orchestrator.health_check().await?;

            if cli.output_json {
                println!("{}", serde_json::json!({ "healthy": true }));
            } else {
                println!("Health Check Results:");
                println!("  Source (SQL Server): OK");
                println!("  Target (PostgreSQL): OK");
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn translate_view(
    file: Option<&Path>,
    translations_file: Option<&Path>,
    output_json: bool,
) -> Result<ExitCode, MigrateError> {
    let sql = match file {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };

    let identifiers = match translations_file {
        Some(path) => IdentifierTranslator::load(path)?,
        None => IdentifierTranslator::identity(),
    };
    let translator = ViewTranslator::new(identifiers);

    let name = file
        .and_then(|p| p.file_stem())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "stdin".to_string());
    let result = translator.translate_sql(&name, &sql);

    if output_json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if let Some(ref translated) = result.target_sql {
        println!("{}", translated);
    }

    match result.error {
        Some(ref reason) => {
            eprintln!("Cannot translate view: {}", reason);
            Ok(ExitCode::FAILURE)
        }
        None => Ok(ExitCode::SUCCESS),
    }
}

fn print_summary(result: &MigrationReport) {
    let status_msg = match result.status {
        RunStatus::Completed => "Migration completed!",
        RunStatus::CompletedWithErrors => "Migration completed with errors.",
        RunStatus::Cancelled => "Migration cancelled.",
        RunStatus::Failed | RunStatus::Running => "Migration failed.",
    };
    println!("\n{}", status_msg);
    println!("  Run ID: {}", result.run_id);
    println!("  Duration: {:.2}s", result.duration_seconds);
    println!(
        "  Tables: {}/{}",
        result.tables_success, result.tables_total
    );
    println!("  Rows: {}", result.rows_transferred);
    println!("  Throughput: {} rows/sec", result.rows_per_second);
    let views_ok = result.views.iter().filter(|v| v.is_success()).count();
    println!("  Views: {}/{}", views_ok, result.views.len());
    if !result.failed_tables.is_empty() {
        println!("  Failed tables: {:?}", result.failed_tables);
    }
    if !result.errors.is_empty() {
        println!("  Errors: {}", result.errors.len());
        for e in &result.errors {
            println!("    {}: {}", e.identifier, e.message);
        }
    }
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Logs go to stderr so --output-json stays machine readable
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Cancel the run on SIGINT (Ctrl-C) or SIGTERM. In-flight batches finish first.
#[cfg(unix)]
fn setup_signal_handler(cancel_token: CancellationToken) {
    let token_int = cancel_token.clone();
    let token_term = cancel_token;

    tokio::spawn(async move {
        if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
            sigint.recv().await;
            eprintln!("\nReceived SIGINT. Stopping after in-flight batches...");
            token_int.cancel();
        }
    });

    tokio::spawn(async move {
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            sigterm.recv().await;
            eprintln!("\nReceived SIGTERM. Stopping after in-flight batches...");
            token_term.cancel();
        }
    });
}

#[cfg(not(unix))]
fn setup_signal_handler(cancel_token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Stopping after in-flight batches...");
            cancel_token.cancel();
        }
    });
}
