use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

use filedist::constants::shutdown::DRAIN_GRACE_SECS;
use filedist::maintenance::{ActiveReferences, FileActiveReferences};
use filedist::service::FileDistributionService;
use filedist::{load_config, logging};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "filedist.toml")]
    config: String,

    /// Override the configured listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the configured store directory
    #[arg(short, long)]
    store_dir: Option<PathBuf>,

    /// Mirror logs to this file in addition to stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init_logging(args.log_file.as_deref());

    let mut config = load_config(&args.config)?;
    if let Some(port) = args.port {
        config.listen_port = port;
    }
    if let Some(store_dir) = args.store_dir {
        config.store_dir = store_dir;
    }

    let oracle: Option<Arc<dyn ActiveReferences>> = config
        .active_references_file
        .clone()
        .map(|path| Arc::new(FileActiveReferences::new(path)) as Arc<dyn ActiveReferences>);

    let service = FileDistributionService::start(config, oracle).await?;
    info!(
        "file distribution service ready on {}",
        service.local_addr()
    );

    signal::ctrl_c().await?;
    info!("shutdown signal received");

    let grace = Duration::from_secs(DRAIN_GRACE_SECS);
    if let Err(e) = service.close(grace).await {
        warn!("shutdown was not clean: {}", e);
        return Err(e);
    }
    Ok(())
}
