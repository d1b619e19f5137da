use std::panic;
use std::path::PathBuf;
use std::sync::Arc;
use std::{env, fs};

use anyhow::Result;
use clap::Parser;
use log::info;

use typekv::db::Database;
use typekv::kv::{EngineKv, Kv, MemoryKv};
use typekv::storage::log_cask::LogCask;

use typekv_cli::command::{self, Command};
use typekv_cli::config::ConfigLoad;
use typekv_cli::trace;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    /// Configuration file path.
    #[clap(short = 'c', long = "config", default_value = "config/typekv-cli.toml")]
    config: String,

    /// Directory for a durable backend; omit to run against a throwaway
    /// in-memory one.
    #[clap(long)]
    data_dir: Option<PathBuf>,

    #[clap(short = 'l', long)]
    log_level: Option<String>,

    #[clap(subcommand)]
    command: Command,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    setup_panic_hooks();

    let args = Args::parse();

    let mut cfg = ConfigLoad::new(&args.config).unwrap_or_default();
    if let Some(data_dir) = &args.data_dir {
        cfg.data_dir = Some(data_dir.to_string_lossy().into_owned());
    }
    if let Some(log_level) = &args.log_level {
        cfg.log_level = log_level.clone();
    }

    let log_dir = format!("{}/.typekv-cli", env::var("HOME").unwrap_or_else(|_| ".".to_string()));
    let _guards = trace::init_logging(&log_dir, &cfg.log_level).await?;
    info!("typekv-cli starting with config: {:?}", &cfg);

    let kv: Arc<dyn Kv> = match &cfg.data_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            Arc::new(EngineKv::new(LogCask::new(PathBuf::from(dir))?)?)
        }
        None => Arc::new(MemoryKv::new()),
    };
    let db = Database::new(kv);

    command::run(&db, args.command)
}

fn setup_panic_hooks() {
    let meta = human_panic::Metadata {
        version: env!("CARGO_PKG_VERSION").into(),
        name: env!("CARGO_PKG_NAME").into(),
        authors: env!("CARGO_PKG_AUTHORS").replace(':', ", ").into(),
        homepage: env!("CARGO_PKG_HOMEPAGE").into(),
    };

    let default_hook = panic::take_hook();

    if env::var("RUST_BACKTRACE").is_err() {
        panic::set_hook(Box::new(move |info: &panic::PanicInfo| {
            default_hook(info);
            let file_path = human_panic::handle_dump(&meta, info);
            human_panic::print_msg(file_path, &meta)
                .expect("human-panic: printing error message to console failed");
        }));
    }
}
