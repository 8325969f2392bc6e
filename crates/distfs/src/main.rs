//! distfs mount daemon

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use distfs::cli::Cli;
use distfs::filter::{CommandFilter, Filter, IdentityFilter};
use distfs::session::spawn_session;
use distfs::{Collaborators, DistFs, Mount};
use tokio::runtime::Handle;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = cli.load_config()?;

    let source = cli
        .source
        .canonicalize()
        .with_context(|| format!("source directory {}", cli.source.display()))?;
    let mountpoint = cli
        .mountpoint
        .canonicalize()
        .with_context(|| format!("mountpoint {}", cli.mountpoint.display()))?;

    let filter: Arc<dyn Filter> = if config.filter.command.is_empty() {
        Arc::new(IdentityFilter)
    } else {
        Arc::new(CommandFilter::new(
            &config.filter.command,
            &config.filter.extensions,
        )?)
    };

    let runtime = Handle::current();
    let collab = Collaborators::local(filter, runtime.clone())?;
    let mount = Arc::new(Mount::new(&source, &mountpoint, collab).await?);

    let fs = DistFs::new(mount.clone(), runtime, &config);
    let session = spawn_session(fs, &mountpoint, &config.mount)?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupted, shutting down");
    mount.shutdown();
    drop(session);
    Ok(())
}
