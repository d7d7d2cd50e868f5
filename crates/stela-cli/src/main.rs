mod cmd;
mod db_adapter;
mod signal;

use clap::{Parser, Subcommand};

use stela_core::config;

#[derive(Parser)]
#[command(
    name = "stela",
    version,
    about = "Backup/restore sidecar for a columnar database node",
    after_help = "\
Configuration file lookup order:
  1. --config <path>          (explicit flag)
  2. $STELA_CONFIG            (environment variable)
  3. ./stela.yaml             (working directory)
  4. /etc/stela/config.yaml   (system)

Environment variables:
  STELA_CONFIG       Path to configuration file
  STELA_DB_CONTROL   Database management binary (default: nodetool)

Restore exit codes: 0 success, 2 configuration error, 3 manifest not
found, 4 permanent store failure, 5 partial failure."
)]
struct Cli {
    /// Path to configuration file (overrides STELA_CONFIG and default search)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one backup round now
    Backup {
        /// Sweep incrementals and commit logs only; no snapshot, no manifest
        #[arg(long)]
        incremental: bool,
    },

    /// Rebuild this node's files from a point in time
    Restore {
        /// Ring token to restore (defaults to this node's token)
        #[arg(long)]
        token: Option<String>,

        /// Target instant: yyyyMMddHHmm or RFC 3339
        #[arg(long)]
        at: String,

        /// Only restore this keyspace
        #[arg(long)]
        keyspace: Option<String>,

        /// Only restore this column family (with --keyspace)
        #[arg(long)]
        column_family: Option<String>,
    },

    /// Run scheduled backup rounds until signalled
    Daemon,

    /// List manifests for a token
    List {
        #[arg(long)]
        token: Option<String>,
    },
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    std::process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    let path = match config::resolve_config_path(cli.config.as_deref()) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("{e}");
            return 2;
        }
    };
    let loaded = match config::load_config(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{e}");
            return 2;
        }
    };
    let runtime = match cmd::Runtime::new(loaded) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{e}");
            return cmd::exit_code(&e);
        }
    };

    match cli.command {
        Commands::Backup { incremental } => cmd::backup::run(&runtime, incremental),
        Commands::Restore {
            token,
            at,
            keyspace,
            column_family,
        } => cmd::restore::run(&runtime, token, &at, keyspace, column_family),
        Commands::Daemon => cmd::daemon::run(&runtime),
        Commands::List { token } => cmd::list::run(&runtime, token),
    }
}
