//! # Data Request Harness CLI (`drq`)
//!
//! The `drq` binary plans, runs and verifies the data requests of one
//! case.
//!
//! ## Usage
//!
//! ```bash
//! drq --config ./config/drq.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `drq init` | Create the case store and run schema migrations |
//! | `drq plan` | Merge the default request set into the catalog |
//! | `drq run` | Execute every due request and write a run report |
//! | `drq verify <connector>` | Pre-flight check of credentials and endpoint |
//! | `drq table show <name>` | Print a case table |
//! | `drq table import <name> <file>` | Replace a case table from JSON |
//! | `drq completions <shell>` | Print shell completions |
//!
//! ## Examples
//!
//! ```bash
//! # Seed the site location, then plan and run
//! drq init
//! drq table import LOCATION ./location.json
//! drq plan --dry-run
//! drq plan
//! drq run --progress human
//!
//! # Re-run a single request
//! drq run --only REQ-KMA-ASOS
//!
//! # Check a map layer's credentials before enabling it
//! drq verify WMS --request REQ-WMS-FLOOD
//! ```

use std::io;
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;

use datareq_harness::config;
use datareq_harness::migrate;
use datareq_harness::planner;
use datareq_harness::progress::ProgressMode;
use datareq_harness::runner;
use datareq_harness::tables;
use datareq_harness::verify;

/// Data Request Harness: provenance-stamped external data for a case.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/drq.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "drq",
    about = "Data Request Harness: plan, fetch and overlay external data into a case store",
    version,
    long_about = "Data Request Harness keeps a catalog of declarative data requests per case \
    (weather statistics, air quality, census series, map figures, geocoding, document pages and \
    geometric overlays), executes them in priority order, merges the results into case tables and \
    records an immutable evidence trail for every value written."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/drq.toml`. Credentials are read from the
    /// environment, never from this file.
    #[arg(long, global = true, default_value = "./config/drq.toml")]
    config: PathBuf,

    /// Log output format on stderr.
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    /// Human progress when stderr is a terminal, otherwise none.
    Auto,
    Human,
    Json,
    Off,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Auto => ProgressMode::default_for_tty(),
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
            ProgressArg::Off => ProgressMode::Off,
        }
    }
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the case store.
    ///
    /// Creates the SQLite database and the case directory layout. This
    /// command is idempotent.
    Init,

    /// Plan the default requests and merge them into the catalog.
    ///
    /// Existing rows keep user-edited fields; new defaults are inserted;
    /// nothing is ever deleted.
    Plan {
        /// Show the merged catalog without writing it.
        #[arg(long)]
        dry_run: bool,
    },

    /// Execute every due request in catalog order.
    ///
    /// Writes `reports/_data_requests_run.json` under the case directory.
    Run {
        /// Only consider these request ids (repeatable).
        #[arg(long = "only")]
        only: Vec<String>,

        /// Progress reporting on stderr.
        #[arg(long, value_enum, default_value = "auto")]
        progress: ProgressArg,
    },

    /// Pre-flight check of one connector (or `all`). Never writes.
    Verify {
        /// Connector name, e.g. `KMA_ASOS`, or `all`.
        connector: String,

        /// Use this catalog request's parameters for the check.
        #[arg(long)]
        request: Option<String>,
    },

    /// Inspect or seed case tables.
    Table {
        #[command(subcommand)]
        action: TableAction,
    },

    /// Print shell completions.
    Completions {
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum TableAction {
    /// Print a table.
    Show {
        name: String,
        /// Print rows as a JSON array.
        #[arg(long)]
        json: bool,
    },
    /// Replace a table with rows from a JSON file.
    ///
    /// The file holds an array of row objects, or
    /// `{"columns": [...], "rows": [...]}`.
    Import { name: String, file: PathBuf },
}

fn init_logging(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("datareq_harness=info"))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "drq", &mut io::stdout());
        return Ok(());
    }

    init_logging(cli.log_format)?;
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            std::fs::create_dir_all(cfg.reports_dir())?;
            println!("Case store initialized: {}", cfg.db.path.display());
        }
        Commands::Plan { dry_run } => {
            planner::run_plan(&cfg, dry_run).await?;
        }
        Commands::Run { only, progress } => {
            runner::run_cli(&cfg, only, progress.into()).await?;
        }
        Commands::Verify { connector, request } => {
            verify::run_verify(&cfg, &connector, request.as_deref()).await?;
        }
        Commands::Table { action } => match action {
            TableAction::Show { name, json } => {
                tables::run_table_show(&cfg, &name, json).await?;
            }
            TableAction::Import { name, file } => {
                tables::run_table_import(&cfg, &name, &file).await?;
            }
        },
        Commands::Completions { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
