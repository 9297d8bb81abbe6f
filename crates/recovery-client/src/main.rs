use anyhow::Context;
use clap::Parser;
use recovery_client::{request_state, MockState};
use std::time::{Duration, Instant};

/// Requests a state transfer from a healthy peer and replays it locally,
/// reporting transfer and installation timings.
#[derive(Debug, Parser)]
#[command(about)]
struct Cli {
    /// State-transfer address of the healthy peer.
    #[arg(long, default_value = "127.0.0.1:14000")]
    recov: String,
    /// First log index requested.
    #[arg(long)]
    first: u64,
    /// Last log index requested.
    #[arg(long)]
    last: u64,
    /// Expect a sharded (multi-log) response.
    #[arg(long)]
    mult: bool,
    /// Seconds to wait before requesting, giving the peer time to log.
    #[arg(long, default_value_t = 0)]
    sleep: u64,
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
    anyhow::ensure!(
        cli.first <= cli.last,
        "invalid interval [{}, {}]",
        cli.first,
        cli.last
    );

    if cli.sleep > 0 {
        tokio::time::sleep(Duration::from_secs(cli.sleep)).await;
    }

    tracing::info!(recov = %cli.recov, first = cli.first, last = cli.last, mult = cli.mult, "requesting state");
    let started = Instant::now();
    let state = request_state(&cli.recov, cli.first, cli.last)
        .await
        .with_context(|| format!("failed to fetch state from {}", cli.recov))?;
    let transfer = started.elapsed();

    let mut replica = MockState::new();
    let started = Instant::now();
    let commands = if cli.mult {
        replica.install_sharded(&state)
    } else {
        replica.install(&state)
    }
    .context("failed to install the received state")?;
    let install = started.elapsed();

    tracing::info!(
        transfer_ms = transfer.as_millis() as u64,
        install_ms = install.as_millis() as u64,
        commands,
        state_bytes = state.len(),
        keys = replica.len(),
        "state transfer complete"
    );
    Ok(())
}
