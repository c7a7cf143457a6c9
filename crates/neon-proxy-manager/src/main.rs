//! neon-proxy-manager: the proxy configuration daemon.
//!
//! # Usage
//!
//! ```text
//! neon-proxy-manager run --data-dir /var/lib/neon-proxy-manager --proxy public --proxy private
//! neon-proxy-manager render --data-dir /var/lib/neon-proxy-manager --proxy public
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use neon_proxy_manager::{ConfigGenerator, ManagerConfig, ProxyManager, RunOptions};
use neon_store::ClusterStore;

#[derive(Parser)]
#[command(name = "neon-proxy-manager", about = "Neon HAProxy configuration manager")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compete for leadership and publish proxy bundles while leading.
    Run {
        /// Data directory for the cluster store.
        #[arg(long, default_value = "/var/lib/neon-proxy-manager")]
        data_dir: PathBuf,

        /// Lock holder identity. Defaults to one derived from the process id.
        #[arg(long)]
        instance_id: Option<String>,

        /// Proxy to manage. Repeat for several.
        #[arg(long = "proxy", default_values = ["public", "private"])]
        proxies: Vec<String>,

        /// Delay between leader lock attempts, in seconds.
        #[arg(long, default_value = "5")]
        lock_retry_seconds: u64,

        /// How long in-flight generation may take to stop, in seconds.
        #[arg(long, default_value = "30")]
        shutdown_timeout_seconds: u64,
    },

    /// Print a proxy's rendered config. Writes nothing to the store.
    Render {
        #[arg(long, default_value = "/var/lib/neon-proxy-manager")]
        data_dir: PathBuf,

        #[arg(long)]
        proxy: String,

        /// Also print the certificate manifest.
        #[arg(long)]
        manifest: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "info,neon_proxy_manager=debug,neon_proxy=debug,neon_store=debug".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            data_dir,
            instance_id,
            proxies,
            lock_retry_seconds,
            shutdown_timeout_seconds,
        } => {
            let options = RunOptions {
                instance_id: instance_id
                    .unwrap_or_else(|| format!("neon-proxy-manager-{}", std::process::id())),
                proxies,
                lock_retry: Duration::from_secs(lock_retry_seconds),
                shutdown_timeout: Duration::from_secs(shutdown_timeout_seconds),
                ..RunOptions::default()
            };
            run(&data_dir, options).await
        }
        Command::Render {
            data_dir,
            proxy,
            manifest,
        } => render(&data_dir, &proxy, manifest).await,
    }
}

fn open_store(data_dir: &Path) -> anyhow::Result<ClusterStore> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("create data dir {}", data_dir.display()))?;
    let db_path = data_dir.join("neon.redb");
    let store = ClusterStore::open(&db_path)?;
    info!(path = ?db_path, "cluster store opened");
    Ok(store)
}

async fn run(data_dir: &Path, options: RunOptions) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;
    let manager = ProxyManager::new(Arc::new(store.clone()), Arc::new(store), options);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    manager.run(shutdown_rx).await?;
    Ok(())
}

async fn render(data_dir: &Path, proxy: &str, manifest: bool) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;
    let settings = ManagerConfig::read(&store).await?;
    let generator =
        ConfigGenerator::new(Arc::new(store.clone()), Arc::new(store), settings).dry_run();

    let prepared = generator.prepare(proxy).await?;
    print!("{}", prepared.rendered.config);
    if manifest {
        println!("# .certmanifest");
        print!("{}", prepared.rendered.manifest_text());
    }
    info!(proxy, hash = %prepared.hash, warnings = prepared.warnings.len(), "rendered");
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
