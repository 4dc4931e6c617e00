//! `repertory` - thin runnable wiring of `repertory-engine` against a
//! demo local-disk `Provider`. Host adapters (FUSE/WinFSP) and real
//! provider backends (S3, Sia) are out of scope; this binary exists to
//! load configuration, start the engine, and prove the wiring works.

mod local_provider;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use repertory_core::config::EngineConfig;
use repertory_core::events::{Event, EventBus};
use repertory_core::meta_store::{InMemoryMetaStore, MetaStore, RocksMetaStore};
use repertory_engine::{EvictionOrder, EvictionSweeper, FileManager, Frequency, Polling};

use local_provider::LocalDiskProvider;

#[derive(Parser)]
#[command(
    name = "repertory",
    version = env!("CARGO_PKG_VERSION"),
    about = "Chunked cache-and-upload engine demo runner",
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file path (default: platform config dir).
    #[arg(long, global = true, env = "REPERTORY_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine against a local-disk demo provider.
    Run(RunArgs),

    /// Manage configuration.
    Config(ConfigArgs),

    /// Inspect the local cache directory.
    Cache(CacheArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Directory standing in for the remote object store.
    #[arg(long, value_name = "PATH")]
    store: PathBuf,

    /// Mount the store read-only (rejects writes/uploads).
    #[arg(long)]
    read_only: bool,

    /// Use a persisted RocksDB meta store instead of the in-memory fake.
    #[arg(long)]
    persist_meta: bool,
}

#[derive(Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommands,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML.
    Show,
    /// Print the configuration file path.
    Path,
    /// Write a sample configuration file to the default path.
    Init,
}

#[derive(Args)]
struct CacheArgs {
    #[command(subcommand)]
    command: CacheCommands,
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Print the cache directory and its current size on disk.
    Stats,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load(),
    };

    match &cli.command {
        Commands::Run(args) => run(config, args),
        Commands::Config(args) => run_config(config, args),
        Commands::Cache(args) => run_cache(config, args),
    }
}

fn setup_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::from_default_env().add_directive(level.into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(config: EngineConfig, args: &RunArgs) -> anyhow::Result<()> {
    let provider = Arc::new(LocalDiskProvider::new(&args.store, args.read_only)?);
    let event_bus = Arc::new(EventBus::new());
    event_bus.subscribe(Arc::new(log_event));

    let meta_store: Arc<dyn MetaStore> = if args.persist_meta {
        Arc::new(RocksMetaStore::open(&config.cache_dir().join("meta"))?)
    } else {
        Arc::new(InMemoryMetaStore::new())
    };

    let file_manager = FileManager::new(config.clone(), provider, meta_store.clone(), event_bus.clone());
    file_manager.start()?;

    let polling = Polling::new(config.polling.clone());
    {
        let fm = file_manager.clone();
        polling.set_callback("timed_out_close", Frequency::High, Box::new(move || fm.sweep_timed_out()));
    }
    {
        let fm = file_manager.clone();
        polling.set_callback("check_deleted", Frequency::Low, Box::new(move || fm.reap_deleted()));
    }
    {
        let sweeper = Arc::new(EvictionSweeper::new(
            file_manager.clone(),
            meta_store,
            config.cache_max_bytes * 9 / 10,
            EvictionOrder::Accessed,
        ));
        polling.set_callback("evict_cache", Frequency::Medium, Box::new(move || sweeper.run()));
    }
    polling.start();

    info!(store = %args.store.display(), cache = %config.cache_dir().display(), "repertory engine running");
    println!("repertory engine running against {}", args.store.display());
    println!("cache directory: {}", config.cache_dir().display());
    println!("press Enter to shut down");

    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;

    polling.stop();
    file_manager.stop();
    Ok(())
}

fn log_event(event: &Event) {
    if let Some(api_path) = event.api_path() {
        info!(api_path, "{:?}", event);
    } else {
        info!("{:?}", event);
    }
}

fn run_config(config: EngineConfig, args: &ConfigArgs) -> anyhow::Result<()> {
    match &args.command {
        ConfigCommands::Show => println!("{}", toml::to_string_pretty(&config)?),
        ConfigCommands::Path => {
            if let Some(path) = EngineConfig::default_path() {
                println!("{}", path.display());
            } else {
                println!("no configuration directory available on this platform");
            }
        }
        ConfigCommands::Init => {
            EngineConfig::default().save()?;
            if let Some(path) = EngineConfig::default_path() {
                println!("wrote sample configuration to {}", path.display());
            }
        }
    }
    Ok(())
}

fn run_cache(config: EngineConfig, args: &CacheArgs) -> anyhow::Result<()> {
    match &args.command {
        CacheCommands::Stats => {
            let dir = config.cache_dir();
            let size = dir_size(&dir);
            println!("cache directory: {}", dir.display());
            println!("on-disk size:    {size} bytes");
            println!("configured max:  {} bytes", config.cache_max_bytes);
        }
    }
    Ok(())
}

fn dir_size(dir: &std::path::Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut total = 0;
    for entry in entries.flatten() {
        let Ok(md) = entry.metadata() else { continue };
        if md.is_dir() {
            total += dir_size(&entry.path());
        } else {
            total += md.len();
        }
    }
    total
}
