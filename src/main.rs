use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use gcp_pubsub_graph::commands::{self, GenerateOptions, ScanOptions, ScanReport};
use gcp_pubsub_graph::config::Config;
use gcp_pubsub_graph::error::PartialFailure;
use gcp_pubsub_graph::render::{Layout, OutputFormat};
use gcp_pubsub_graph::storage::{SqliteStore, Store};
use gcp_pubsub_graph::VERSION;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Map GCP Pub/Sub topics and subscriptions across projects
#[derive(Parser, Debug)]
#[command(name = "gcp-pubsub-graph", version = VERSION, about, long_about = None)]
struct Args {
    /// Config file (default: $GCP_VISUALIZER_CONFIG or the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite cache file, overriding the config
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Log level (RUST_LOG takes precedence when set)
    #[arg(long, value_enum, default_value = "warn", global = true)]
    log_level: LogLevel,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan GCP projects for Pub/Sub resources
    Scan {
        /// Projects to scan (comma-separated or repeated)
        #[arg(short, long, value_delimiter = ',')]
        projects: Vec<String>,

        /// Scan every accessible project
        #[arg(long, conflicts_with = "projects")]
        all: bool,

        /// Limit --all to one organization
        #[arg(long, requires = "all")]
        organization: Option<String>,

        /// Rescan even if cached data is fresh
        #[arg(short, long)]
        force: bool,

        #[command(flatten)]
        limits: LimitArgs,
    },

    /// Rescan cached projects whose data is older than the TTL
    Sync {
        #[command(flatten)]
        limits: LimitArgs,
    },

    /// Render cached data as a graph
    Generate {
        /// Only include these projects (comma-separated or repeated)
        #[arg(short, long, value_delimiter = ',')]
        projects: Vec<String>,

        /// Output format
        #[arg(short, long, value_enum)]
        format: Option<OutputFormat>,

        /// Graphviz layout engine for image formats
        #[arg(short, long, value_enum)]
        layout: Option<Layout>,

        /// Output file, or `-` for stdout (default: pubsub-graph.<format>)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List cached projects and when they were last synced
    Projects,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show version
    Version,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the config file path
    Path,
}

#[derive(clap::Args, Debug)]
struct LimitArgs {
    /// API requests per second
    #[arg(long)]
    requests_per_second: Option<f64>,

    /// Projects collected at the same time
    #[arg(long)]
    max_concurrent: Option<usize>,
}

impl LimitArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(rps) = self.requests_per_second {
            config.rate_limits.requests_per_second = rps;
        }
        if let Some(max) = self.max_concurrent {
            config.rate_limits.max_concurrent = max;
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

fn setup_logging(
    level: LogLevel,
    log_file: Option<&Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    let Some(log_path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
        return Ok(None);
    };

    if let Some(parent) = log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("failed to open log file {}", log_path.display()))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("gcp-pubsub-graph {} started with log level: {:?}", VERSION, level);
    tracing::info!("Log file: {:?}", log_path);

    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _log_guard = setup_logging(args.log_level, args.log_file.as_deref())?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, stopping...");
            on_signal.cancel();
        }
    });

    let config_path = args.config.clone().or_else(Config::config_path);
    let mut config = Config::load(config_path.as_deref())?;
    if let Some(database) = &args.database {
        config.cache.database = Some(database.clone());
    }

    match args.command {
        Command::Scan {
            projects,
            all,
            organization,
            force,
            limits,
        } => {
            limits.apply(&mut config);
            config.validate()?;
            let options = ScanOptions {
                projects,
                all,
                organization_id: organization,
                force,
            };
            let (cancel, config) = (&cancel, &config);
            with_store(config, |store| async move {
                let report = commands::scan(cancel, store, config, &options).await?;
                finish_scan(report)
            })
            .await
        },
        Command::Sync { limits } => {
            limits.apply(&mut config);
            config.validate()?;
            let (cancel, config) = (&cancel, &config);
            with_store(config, |store| async move {
                let report = commands::sync(cancel, store, config).await?;
                finish_scan(report)
            })
            .await
        },
        Command::Generate {
            projects,
            format,
            layout,
            output,
        } => {
            let format = format.unwrap_or(config.visualization.output_format);
            let options = GenerateOptions {
                projects,
                format,
                layout: layout.unwrap_or(config.visualization.layout),
                output: match output {
                    Some(path) if path.as_os_str() == "-" => None,
                    Some(path) => Some(path),
                    None => Some(PathBuf::from(format!("pubsub-graph.{format}"))),
                },
            };
            let (cancel, config) = (&cancel, &config);
            with_store(config, |store| async move {
                commands::generate(cancel, store, config, &options).await
            })
            .await
        },
        Command::Projects => {
            let (cancel, config) = (&cancel, &config);
            with_store(config, |store| async move {
                commands::list_projects(cancel, store.as_ref(), config).await
            })
            .await
        },
        Command::Config { action } => match action {
            ConfigAction::Show => commands::config_show(&config, config_path.as_deref()),
            ConfigAction::Init { force } => {
                let path = config_path.context("could not determine config directory")?;
                commands::config_init(&path, force)
            },
            ConfigAction::Path => {
                match config_path {
                    Some(path) => println!("{}", path.display()),
                    None => println!("(no config directory)"),
                }
                Ok(())
            },
        },
        Command::Version => {
            println!("gcp-pubsub-graph version: {}", VERSION);
            Ok(())
        },
    }
}

/// Open the store, run `body`, then close the store even if `body` failed.
async fn with_store<F, Fut>(config: &Config, body: F) -> Result<()>
where
    F: FnOnce(Arc<dyn Store>) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let path = config.database_path();
    tracing::debug!("Using cache database {}", path.display());
    let store = Arc::new(
        SqliteStore::open(&path)
            .with_context(|| format!("failed to open cache database {}", path.display()))?,
    );

    let result = body(store.clone()).await;

    if let Err(e) = store.close() {
        tracing::warn!("Failed to close cache database: {}", e);
    }
    result
}

fn finish_scan(report: ScanReport) -> Result<()> {
    report.print_summary();
    if report.is_success() {
        return Ok(());
    }
    Err(PartialFailure {
        failed: report.failed.len(),
        total: report.collected.len() + report.failed.len(),
    }
    .into())
}
