//! Client-facing server: accepts sessions, funnels their requests into the
//! store, and fans replies back out over one shared UDP socket.

use crate::session::{Request, Session};
use crate::store::Store;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct Server {
    joins: mpsc::Sender<TcpStream>,
    udp: UdpSocket,
    cancel: CancellationToken,
}

impl Server {
    pub async fn new(store: Arc<Store>, cancel: CancellationToken) -> crate::Result<Arc<Server>> {
        let udp = UdpSocket::bind("0.0.0.0:0").await?;
        let (joins_tx, joins_rx) = mpsc::channel(64);

        let server = Arc::new(Server {
            joins: joins_tx,
            udp,
            cancel: cancel.clone(),
        });
        tokio::spawn(run(Arc::clone(&server), store, joins_rx, cancel));
        Ok(server)
    }

    /// Hand a freshly accepted client connection to the server loop.
    pub async fn register(&self, conn: TcpStream) {
        let _ = self.joins.send(conn).await;
    }

    /// Send one reply datagram. Safe to call concurrently.
    pub async fn send_udp(&self, addr: &str, payload: &[u8]) -> crate::Result<()> {
        self.udp.send_to(payload, addr).await?;
        Ok(())
    }

    pub fn exit(&self) {
        self.cancel.cancel();
    }
}

async fn run(
    server: Arc<Server>,
    store: Arc<Store>,
    mut joins: mpsc::Receiver<TcpStream>,
    cancel: CancellationToken,
) {
    let (incoming_tx, mut incoming) = mpsc::channel::<Request>(256);
    let mut sessions: Vec<Session> = Vec::new();

    loop {
        tokio::select! {
            conn = joins.recv() => {
                let Some(conn) = conn else { break };
                let (session, mut requests) = Session::spawn(conn, &cancel);

                // Fan this session's requests into the server-wide queue.
                let tx = incoming_tx.clone();
                tokio::spawn(async move {
                    while let Some(request) = requests.recv().await {
                        if tx.send(request).await.is_err() {
                            return;
                        }
                    }
                });

                sessions.retain(|s| !s.is_closed());
                sessions.push(session);
            }
            request = incoming.recv() => {
                let Some(request) = request else { break };
                // Awaited inline so proposals keep per-client arrival order.
                if let Err(error) = store
                    .propose(request.command, Some(server.as_ref()), &request.ip)
                    .await
                {
                    tracing::warn!(%error, client = %request.ip, "dropping request");
                }
            }
            _ = cancel.cancelled() => break,
        }
    }

    for session in &sessions {
        session.disconnect();
    }
}

/// Accept client connections and hand them to the server until cancelled.
pub async fn serve_clients(listener: TcpListener, server: Arc<Server>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            accept = listener.accept() => {
                let Ok((conn, _)) = accept else { continue };
                server.register(conn).await;
            }
            _ = cancel.cancelled() => return,
        }
    }
}
