use std::path::PathBuf;

use cdb_dal::{config::Config, server::run_with_config_until_ctrl_c};
use clap::Parser;
use n0_snafu::{Result, ResultExt};
use tracing::debug;
use tracing_subscriber::{EnvFilter, prelude::*};

#[derive(Parser, Debug)]
struct Cli {
    /// Path to config file
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Database root. The node tree is read from its `CDB` subdirectory.
    #[clap(short, long)]
    root: Option<PathBuf>,
    /// Do not replay persisted change listeners on startup.
    #[clap(short, long)]
    no_recovery: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();
    let args = Cli::parse();

    let mut config = if let Some(path) = args.config {
        debug!("loading config from {:?}", path);
        Config::load(path).await.e()?
    } else {
        debug!("using default config");
        Config::default()
    };
    if let Some(root) = args.root {
        config.root = root;
    }
    if args.no_recovery {
        config.recovery.replay = false;
    }

    run_with_config_until_ctrl_c(config).await.e()
}
