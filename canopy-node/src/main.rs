// canopy: run one overlay node from the command line.

use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use canopy_core::Logger;
use canopy_node::{config, Node, Role};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Self-forming overlay tree that distributes and runs code modules")]
struct Cli {
    /// Optional path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Listening port for a root node (overrides config file and environment).
    #[arg(long)]
    port: Option<u16>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the tree: listen for joiners.
    Root(UploadArgs),
    /// Join the tree through any member.
    Join {
        /// Endpoint of any current member, e.g. 203.0.113.5:6974.
        seed: SocketAddrV4,
        #[command(flatten)]
        upload: UploadArgs,
    },
}

#[derive(Args, Clone, Debug, Default)]
struct UploadArgs {
    /// WebAssembly module to upload and run across the tree.
    #[arg(long)]
    upload: Option<PathBuf>,
    /// Seconds to wait for children to attach before uploading.
    #[arg(long, default_value_t = 5)]
    upload_delay_secs: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        cfg.listen_port = port;
    }
    let (role, upload) = match cli.command {
        Command::Root(upload) => (Role::Root, upload),
        Command::Join { seed, upload } => (Role::Joiner { seed }, upload),
    };
    let image = match &upload.upload {
        Some(path) => {
            Some(std::fs::read(path).with_context(|| format!("reading {}", path.display()))?)
        }
        None => None,
    };

    let node = Arc::new(Node::new(role, cfg, Logger::tracing()));
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let mut init = tokio::task::spawn_blocking({
            let node = node.clone();
            move || node.initialize()
        });
        let endpoint = tokio::select! {
            joined = &mut init => joined?.context("initialize")?,
            signal = shutdown_signal() => {
                signal?;
                info!("interrupted during bootstrap");
                node.cancel();
                // The chase stops between hops; the result no longer matters.
                let _ = init.await;
                return Ok(());
            }
        };
        info!(%endpoint, "node ready");
        node.begin_execution()?;

        if let Some(image) = image {
            let node = node.clone();
            let delay = Duration::from_secs(upload.upload_delay_secs);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                match node.upload_code(image) {
                    Ok(()) => info!("code module uploaded"),
                    Err(e) => warn!("upload failed: {e}"),
                }
            });
        }

        shutdown_signal().await
    })?;

    info!("shutting down");
    node.shutdown();
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
