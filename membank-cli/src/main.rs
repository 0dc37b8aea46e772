use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use membank::config::{BackendKind, CacheConfig, ManagerConfig};
use membank::manager::Manager;
use membank::resolver::ResolverMode;

use membank_cli::command::{run_command, Command};
use membank_cli::config::ConfigLoad;
use membank_cli::trace;

#[derive(Debug, Parser)]
#[command(version, author, about = "membank CLI")]
pub struct Args {
    /// Configuration file path.
    #[clap(short = 'c', long = "config", default_value = "config/membank.yaml")]
    config: String,

    #[clap(long, help = "Override the configured backend: tabular | tree")]
    backend: Option<String>,

    #[clap(long, help = "Override the configured data directory")]
    data_dir: Option<PathBuf>,

    #[clap(short = 'l', long, default_value = "info")]
    log_level: String,

    #[clap(short, long, help = "print the resolved configuration before running")]
    debug: bool,

    #[clap(subcommand)]
    cmd: Command,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    let args = Args::parse();

    let log_dir = format!(
        "{}/.membank-cli",
        std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
    );
    let _guards = trace::init_logging(&log_dir, &args.log_level).await?;

    let mut cfg = ConfigLoad::load(&args.config);
    if let Some(backend) = &args.backend {
        cfg.backend = backend.clone();
    }
    if let Some(data_dir) = &args.data_dir {
        cfg.data_dir = data_dir.display().to_string();
    }
    if args.debug {
        println!("{cfg:#?}");
    }
    info!("membank-cli starting with config: {:?}", &cfg);

    let backend = match cfg.backend.as_str() {
        "tree" => BackendKind::Tree {
            root: PathBuf::from(&cfg.data_dir),
        },
        _ => BackendKind::TabularDurable {
            path: PathBuf::from(&cfg.data_dir),
        },
    };

    let manager_config = ManagerConfig {
        node_id: cfg.node_id.clone(),
        backend,
        cache: CacheConfig::default(),
        replication: None,
        resolver_mode: ResolverMode::VectorClock,
        vector_dimensions: cfg.vector_dimensions,
        namespaces_enabled: true,
    };

    let mut manager = Manager::new(manager_config).context("failed to open memory bank")?;
    let result = run_command(args.cmd, &mut manager);
    manager.close().context("failed to close memory bank cleanly")?;
    result
}
