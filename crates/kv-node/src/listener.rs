//! Side listeners: cluster joins and state-transfer requests.
//!
//! Both accept loops run until cancelled. A malformed request or a failed
//! handler aborts the listener; the rest of the node keeps running.

use crate::store::Store;
use crate::{Error, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Accept join requests: one line `"<id>-<addr>-<voter>\n"` per connection.
pub async fn serve_joins(listener: TcpListener, store: Arc<Store>, cancel: CancellationToken) {
    loop {
        let conn = tokio::select! {
            conn = listener.accept() => conn,
            _ = cancel.cancelled() => return,
        };
        let Ok((conn, _)) = conn else {
            tracing::error!("join listener accept failed");
            return;
        };
        if let Err(error) = handle_join(conn, &store).await {
            tracing::error!(%error, "join request failed; stopping join listener");
            return;
        }
    }
}

async fn handle_join(conn: TcpStream, store: &Store) -> Result<()> {
    let mut line = String::new();
    BufReader::new(conn).read_line(&mut line).await?;

    let line = line.trim_end_matches('\n');
    let parts: Vec<&str> = line.split('-').collect();
    if parts.len() < 3 {
        return Err(Error::Protocol(format!("incorrect join request {line:?}")));
    }
    let voter = parts[2]
        .parse::<bool>()
        .map_err(|_| Error::Protocol(format!("bad voter flag {:?}", parts[2])))?;

    store.join(parts[0], parts[1], voter).await
}

/// Accept state-transfer requests: one line `"<remote>-<first>-<last>\n"`
/// per connection, answered with the framed application log and EOF.
pub async fn serve_state_transfer(
    listener: TcpListener,
    store: Arc<Store>,
    cancel: CancellationToken,
) {
    loop {
        let conn = tokio::select! {
            conn = listener.accept() => conn,
            _ = cancel.cancelled() => return,
        };
        let Ok((conn, _)) = conn else {
            tracing::error!("state-transfer listener accept failed");
            return;
        };
        if let Err(error) = handle_transfer(conn, &store).await {
            tracing::error!(%error, "state transfer failed; stopping transfer listener");
            return;
        }
    }
}

async fn handle_transfer(conn: TcpStream, store: &Store) -> Result<()> {
    let mut reader = BufReader::new(conn);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let line = line.trim_end_matches('\n');
    let parts: Vec<&str> = line.split('-').collect();
    if parts.len() != 3 {
        return Err(Error::Protocol(format!("incorrect state request {line:?}")));
    }
    let first: u64 = parts[1]
        .parse()
        .map_err(|_| Error::Protocol(format!("bad first index {:?}", parts[1])))?;
    let last: u64 = parts[2]
        .parse()
        .map_err(|_| Error::Protocol(format!("bad last index {:?}", parts[2])))?;

    let mut conn = reader.into_inner();
    store.transfer_state(first, last, &mut conn).await?;
    conn.shutdown().await?;
    Ok(())
}
