//! TCP transport for consensus RPCs.
//!
//! Requests and responses are framed as a big-endian `u32` length prefix and
//! a JSON body. A server-side consensus failure closes the connection; the
//! calling peer maps the resulting EOF to `Unreachable` and retries through
//! openraft's own machinery.

use crate::raft::{NodeId, Raft, TypeConfig};
use openraft::error::{InstallSnapshotError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::{AnyError, BasicNode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// One consensus RPC, as framed on the wire.
#[derive(Serialize, Deserialize)]
pub enum RaftRequest {
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    Vote(VoteRequest<NodeId>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
}

async fn write_frame<W, T>(w: &mut W, msg: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(msg)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    w.write_all(&(body.len() as u32).to_be_bytes()).await?;
    w.write_all(&body).await?;
    w.flush().await
}

/// Read one frame; `None` on clean EOF at a frame boundary.
async fn read_frame<R, T>(r: &mut R) -> std::io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len = [0u8; 4];
    match r.read_exact(&mut len).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
    r.read_exact(&mut body).await?;
    let msg = serde_json::from_slice(&body)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    Ok(Some(msg))
}

/// Creates per-peer connections for outbound consensus RPCs.
pub struct Network;

impl RaftNetworkFactory<TypeConfig> for Network {
    type Network = NetworkConnection;

    async fn new_client(&mut self, _target: NodeId, node: &BasicNode) -> Self::Network {
        NetworkConnection {
            addr: node.addr.clone(),
        }
    }
}

/// A lazily-dialed peer; each RPC is one dial, one frame out, one frame in.
pub struct NetworkConnection {
    addr: String,
}

impl NetworkConnection {
    async fn call<Resp: DeserializeOwned>(&self, req: RaftRequest) -> std::io::Result<Resp> {
        let mut stream = TcpStream::connect(&self.addr).await?;
        write_frame(&mut stream, &req).await?;
        match read_frame(&mut stream).await? {
            Some(resp) => Ok(resp),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed the connection before replying",
            )),
        }
    }
}

fn unreachable(err: impl std::fmt::Display) -> Unreachable {
    Unreachable::new(&AnyError::error(err.to_string()))
}

impl RaftNetwork<TypeConfig> for NetworkConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        self.call(RaftRequest::AppendEntries(rpc))
            .await
            .map_err(|err| RPCError::Unreachable(unreachable(err)))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        self.call(RaftRequest::Vote(rpc))
            .await
            .map_err(|err| RPCError::Unreachable(unreachable(err)))
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        self.call(RaftRequest::InstallSnapshot(rpc))
            .await
            .map_err(|err| RPCError::Unreachable(unreachable(err)))
    }
}

/// Serve inbound consensus RPCs until cancelled.
pub async fn serve(listener: TcpListener, raft: Raft, cancel: CancellationToken) {
    loop {
        tokio::select! {
            accept = listener.accept() => {
                let Ok((stream, _)) = accept else { continue };
                let raft = raft.clone();
                let conn_cancel = cancel.child_token();
                tokio::spawn(async move {
                    if let Err(error) = serve_connection(stream, raft, conn_cancel).await {
                        tracing::debug!(%error, "consensus peer connection ended");
                    }
                });
            }
            _ = cancel.cancelled() => return,
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    raft: Raft,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    loop {
        let req = tokio::select! {
            req = read_frame::<_, RaftRequest>(&mut stream) => req?,
            _ = cancel.cancelled() => return Ok(()),
        };
        let Some(req) = req else { return Ok(()) };

        match req {
            RaftRequest::AppendEntries(rpc) => match raft.append_entries(rpc).await {
                Ok(resp) => write_frame(&mut stream, &resp).await?,
                Err(error) => {
                    tracing::warn!(%error, "append-entries failed");
                    return Ok(());
                }
            },
            RaftRequest::Vote(rpc) => match raft.vote(rpc).await {
                Ok(resp) => write_frame(&mut stream, &resp).await?,
                Err(error) => {
                    tracing::warn!(%error, "vote failed");
                    return Ok(());
                }
            },
            RaftRequest::InstallSnapshot(rpc) => match raft.install_snapshot(rpc).await {
                Ok(resp) => write_frame(&mut stream, &resp).await?,
                Err(error) => {
                    tracing::warn!(%error, "install-snapshot failed");
                    return Ok(());
                }
            },
        }
    }
}
