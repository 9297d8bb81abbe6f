use anyhow::Context;
use clap::Parser;
use kv_node::config::StoreConfig;
use kv_node::server::{self, Server};
use kv_node::store::Store;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Replicated key-value node with a pluggable application-level command log.
#[derive(Debug, Parser)]
#[command(about)]
struct Cli {
    /// Unique server id.
    #[arg(long)]
    id: String,
    /// Client-facing bind address.
    #[arg(long, default_value = ":11000")]
    port: String,
    /// Consensus transport bind address.
    #[arg(long, default_value = ":12000")]
    raft: String,
    /// Join address of a running cluster member, if any. Absence means this
    /// node bootstraps a fresh single-node cluster.
    #[arg(long)]
    join: Option<String>,
    /// Bind address for incoming cluster-join requests.
    #[arg(long)]
    hjoin: Option<String>,
    /// Bind address for incoming state-transfer requests.
    #[arg(long)]
    hrecov: Option<String>,
    /// Log committed commands to a traditional disk log under this folder.
    #[arg(long)]
    logfolder: Option<PathBuf>,
}

/// Accepts the `":11000"` shorthand for an any-interface bind.
fn bind_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(
        id = %cli.id,
        port = %cli.port,
        raft = %cli.raft,
        join = ?cli.join,
        hjoin = ?cli.hjoin,
        hrecov = ?cli.hrecov,
        logfolder = ?cli.logfolder,
        "starting kv node"
    );

    let config = StoreConfig {
        node_id: cli.id.clone(),
        log_folder: cli.logfolder.clone(),
        join_handler_addr: cli.hjoin.as_deref().map(bind_addr),
        recov_handler_addr: cli.hrecov.as_deref().map(bind_addr),
        ..StoreConfig::default()
    };

    let cancel = CancellationToken::new();
    let store = Store::new(config, cancel.clone())
        .await
        .context("failed to initialize the store")?;

    let listener = TcpListener::bind(bind_addr(&cli.port))
        .await
        .context("failed to bind the client listener")?;

    store
        .start_consensus(cli.join.is_none(), &bind_addr(&cli.raft))
        .await
        .context("failed to start consensus")?;

    let server = Server::new(store.clone(), cancel.clone()).await?;

    if let Some(join_addr) = &cli.join {
        send_join_request(join_addr, &cli.id, &cli.raft)
            .await
            .with_context(|| format!("failed to send join request to {join_addr}"))?;
    }

    tokio::spawn(server::serve_clients(
        listener,
        server.clone(),
        cancel.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    cancel.cancel();
    server.exit();
    Ok(())
}

/// One line `"<id>-<raft-addr>-true\n"` asks a member to add us as a voter.
async fn send_join_request(join_addr: &str, id: &str, raft_addr: &str) -> anyhow::Result<()> {
    let mut conn = TcpStream::connect(join_addr).await?;
    conn.write_all(format!("{id}-{raft_addr}-true\n").as_bytes())
        .await?;
    conn.shutdown().await?;
    Ok(())
}
