//! GEPA Console - live telemetry for prompt optimization runs
//!
//! Replays recorded span notifications through the correlation engine and
//! prints the reconciled telemetry records.

use clap::{Parser, Subcommand, ValueEnum};
use gepa_core::config::{ConfigLoader, ConsoleConfig};
use gepa_core::{DatasetLookup, CONSOLE_VERSION};
use gepa_correlate::{
    read_notifications_from_file, CorrelationConfig, CorrelationEngine, NotificationReplay,
    ReplayConfig, ServiceConfig, TelemetryRecord, TelemetryService,
};
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "gepa-console")]
#[command(version)]
#[command(about = "Prompt optimization console telemetry tools", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "GEPA_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a notification log and print the reconciled records
    Replay {
        /// Input file (JSONL span notifications)
        #[arg(short, long)]
        input: PathBuf,

        /// Dataset rows (JSON) used for hydration
        #[arg(short, long)]
        dataset: Option<PathBuf>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "table")]
        format: OutputFormat,

        /// Override the record buffer size
        #[arg(long)]
        max_records: Option<usize>,

        /// Replay speed (0 = instant, 1 = recorded pace)
        #[arg(long, default_value = "0")]
        speed: f64,
    },

    /// Show the raw span list built from a notification log
    Inspect {
        /// Input file (JSONL span notifications)
        #[arg(short, long)]
        input: PathBuf,

        /// Number of spans to show
        #[arg(short, long, default_value = "50")]
        num: usize,
    },

    /// Print the effective configuration
    Config {
        /// Also write it to this path
        #[arg(long)]
        write: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.clone());

    // CLI verbose flag takes precedence, then config
    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match config.console.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Replay {
            input,
            dataset,
            format,
            max_records,
            speed,
        } => replay_command(&config, &input, dataset, format, max_records, speed).await,
        Commands::Inspect { input, num } => inspect_command(&config, &input, num).await,
        Commands::Config { write } => config_command(&config, write),
    }
}

/// Load configuration from file/env, with fallback to defaults
fn load_config(cli_path: Option<PathBuf>) -> ConsoleConfig {
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}, using defaults", e);
            ConsoleConfig::default()
        }
    }
}

async fn replay_command(
    config: &ConsoleConfig,
    input: &Path,
    dataset: Option<PathBuf>,
    format: OutputFormat,
    max_records: Option<usize>,
    speed: f64,
) -> anyhow::Result<()> {
    let mut correlation = CorrelationConfig::from(&config.telemetry);
    if let Some(max) = max_records {
        correlation.max_records = max;
    }

    let mut service = TelemetryService::new(
        CorrelationEngine::new(correlation),
        ServiceConfig::default(),
    );
    let handle = service.start()?;
    info!("GEPA Console v{}", CONSOLE_VERSION);

    let dataset_path = dataset.or_else(|| config.dataset.path.as_ref().map(PathBuf::from));
    if let Some(path) = dataset_path {
        match DatasetLookup::load(&path) {
            Ok(lookup) => {
                info!("Loaded {} dataset rows from {}", lookup.len(), path.display());
                handle.replace_dataset(lookup).await?;
            }
            Err(e) => warn!("Dataset unavailable, records will not be hydrated: {}", e),
        }
    }

    let replay = NotificationReplay::new(ReplayConfig {
        input_file: input.to_path_buf(),
        speed_multiplier: speed,
    });
    let sent = replay.run(&handle).await?;
    handle.flush().await?;

    let engine = service.stop().await?;
    info!("Replayed {} notifications", sent);

    let records = engine.records();
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        OutputFormat::Table => print_records(&records),
    }

    let stats = engine.stats();
    println!();
    println!(
        "{} records from {} notifications ({} merges, {} identity conflicts, {} evicted)",
        records.len(),
        stats.notifications,
        stats.merges,
        stats.identity_conflicts,
        stats.evictions
    );
    Ok(())
}

fn print_records(records: &[&TelemetryRecord]) {
    println!(
        "{:<10} {:<8} {:>8} {:<20} {:<12} {:<10} {:>7} {:>9} {:>5}  ROOT",
        "RECORD", "STATUS", "MS", "MODEL", "ROW", "LABEL", "TOKENS", "COST", "SPANS"
    );
    for record in records {
        let status = format!("{:?}", record.status).to_lowercase();
        println!(
            "{:<10} {:<8} {:>8} {:<20} {:<12} {:<10} {:>7} {:>9} {:>5}  {}",
            truncate(&record.id, 10),
            status,
            record
                .duration_ms
                .map(|d| d.to_string())
                .unwrap_or_else(|| "-".into()),
            truncate(record.fields.model_id.as_deref().unwrap_or("-"), 20),
            truncate(record.dataset_row_id().unwrap_or("-"), 12),
            truncate(record.dataset_row_label().unwrap_or("-"), 10),
            record
                .fields
                .total_tokens
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".into()),
            record
                .fields
                .cost_usd
                .map(|c| format!("${:.4}", c))
                .unwrap_or_else(|| "-".into()),
            record.span_count(),
            record.root.name,
        );

        if let Some(diff) = &record.prompt_diff {
            for line in diff {
                let marker = match line.kind {
                    gepa_correlate::DiffKind::Add => '+',
                    gepa_correlate::DiffKind::Remove => '-',
                    gepa_correlate::DiffKind::Context => ' ',
                };
                println!("           {} {}", marker, line.text);
            }
        }
    }
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut out: String = text.chars().take(width.saturating_sub(1)).collect();
    out.push('~');
    out
}

async fn inspect_command(config: &ConsoleConfig, input: &Path, num: usize) -> anyhow::Result<()> {
    let notifications = read_notifications_from_file(input).await?;

    let mut engine = CorrelationEngine::new(CorrelationConfig::from(&config.telemetry));
    for notification in &notifications {
        engine.ingest(notification);
    }

    for span in engine.raw_spans().iter().take(num) {
        println!("{}", serde_json::to_string_pretty(span)?);
    }
    println!(
        "\n{} notifications, {} raw spans, {} records",
        notifications.len(),
        engine.raw_spans().len(),
        engine.len()
    );
    Ok(())
}

fn config_command(config: &ConsoleConfig, write: Option<PathBuf>) -> anyhow::Result<()> {
    println!("{}", toml::to_string_pretty(config)?);
    if let Some(path) = write {
        ConfigLoader::new().save(config, &path)?;
        println!("# written to {}", path.display());
    }
    Ok(())
}
