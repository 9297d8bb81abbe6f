//! One live client connection: a reader fiber and a writer fiber over a
//! single TCP socket, bridged by channels.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Any line carrying this token ends the sending session, and only it.
pub const CLOSE_TOKEN: &[u8] = b"-CLOSE\n";

/// A request read off a client session, bound for the store.
#[derive(Debug)]
pub struct Request {
    pub command: Vec<u8>,
    /// Peer address without its TCP port; UDP replies route back here.
    pub ip: String,
}

pub struct Session {
    outgoing: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl Session {
    /// Wrap an accepted connection, spawning its reader and writer fibers.
    /// Returns the session handle and its request stream, which yields in
    /// socket read order.
    pub fn spawn(conn: TcpStream, parent: &CancellationToken) -> (Session, mpsc::Receiver<Request>) {
        let cancel = parent.child_token();
        let peer_ip = conn
            .peer_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_default();
        let (read_half, write_half) = conn.into_split();
        let (incoming_tx, incoming_rx) = mpsc::channel(64);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(64);

        tokio::spawn(read_loop(read_half, peer_ip, incoming_tx, cancel.clone()));
        tokio::spawn(write_loop(write_half, outgoing_rx, cancel.clone()));

        (
            Session {
                outgoing: outgoing_tx,
                cancel,
            },
            incoming_rx,
        )
    }

    /// Queue a reply line for the writer fiber.
    pub async fn send(&self, line: String) {
        let _ = self.outgoing.send(line).await;
    }

    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

async fn read_loop(
    read_half: OwnedReadHalf,
    peer_ip: String,
    incoming: mpsc::Sender<Request>,
    cancel: CancellationToken,
) {
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = tokio::select! {
            read = reader.read_until(b'\n', &mut line) => read,
            _ = cancel.cancelled() => return,
        };
        match read {
            // EOF: the client went away; end the session silently.
            Ok(0) => {
                cancel.cancel();
                return;
            }
            Ok(n) if n > 1 => {
                if contains_close_token(&line) {
                    cancel.cancel();
                    return;
                }
                let request = Request {
                    command: line.clone(),
                    ip: peer_ip.clone(),
                };
                if incoming.send(request).await.is_err() {
                    return;
                }
            }
            Ok(_) => {} // bare newline
            Err(error) => {
                tracing::warn!(%error, peer = %peer_ip, "session read failed");
                cancel.cancel();
                return;
            }
        }
    }
}

fn contains_close_token(line: &[u8]) -> bool {
    line.windows(CLOSE_TOKEN.len()).any(|w| w == CLOSE_TOKEN)
}

async fn write_loop(
    write_half: OwnedWriteHalf,
    mut outgoing: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    let mut writer = BufWriter::new(write_half);
    loop {
        let line = tokio::select! {
            line = outgoing.recv() => line,
            _ = cancel.cancelled() => break,
        };
        let Some(line) = line else { break };
        if writer.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        let _ = writer.flush().await;
    }
}
