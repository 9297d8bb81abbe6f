//! The store: owns the map, the application log, and the consensus handle.

use crate::config::StoreConfig;
use crate::fsm::{self, KvStorage, StoreInner};
use crate::network::{self, Network};
use crate::raft::{node_id_from_str, NodeId, Proposal, Raft, Reply};
use crate::server::Server;
use crate::{listener, Error, Result};
use applog::AppLog;
use openraft::storage::Adaptor;
use openraft::{BasicNode, ChangeMembers, SnapshotPolicy};
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// How often file-backed reducing strategies flush their views.
const PERSIST_INTERVAL: Duration = Duration::from_secs(1);

pub struct Store {
    inner: Arc<StoreInner>,
    raft: OnceLock<Raft>,
    node_id: NodeId,
    raft_addr: OnceLock<SocketAddr>,
    join_addr: Option<SocketAddr>,
    recov_addr: Option<SocketAddr>,
    cancel: CancellationToken,
}

impl Store {
    /// Build the store: application log, optional pre-population, side
    /// listeners, and the strategy's background flush fiber. Consensus is
    /// opened separately by [`Store::start_consensus`].
    pub async fn new(config: StoreConfig, cancel: CancellationToken) -> Result<Arc<Self>> {
        if config.node_id.is_empty() {
            return Err(Error::Config("a node id is required".into()));
        }

        let log = AppLog::new(config.effective_strategy(), &config.log_config())?;
        let node_id = node_id_from_str(&config.node_id);
        let inner = Arc::new(StoreInner::new(config.clone(), log));

        if let Some(pre) = config.pre_initialize {
            let mut value = vec![b'!'; pre.value_size];
            if config.compress_values {
                value = fsm::gzip(&value).expect("gzip into a memory buffer cannot fail");
            }
            inner.pre_populate(pre.keys, value);
        }

        let join_listener = match &config.join_handler_addr {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        let recov_listener = match &config.recov_handler_addr {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };

        let store = Arc::new(Self {
            inner,
            raft: OnceLock::new(),
            node_id,
            raft_addr: OnceLock::new(),
            join_addr: join_listener.as_ref().and_then(|l| l.local_addr().ok()),
            recov_addr: recov_listener.as_ref().and_then(|l| l.local_addr().ok()),
            cancel: cancel.clone(),
        });

        if let Some(l) = join_listener {
            tokio::spawn(listener::serve_joins(
                l,
                Arc::clone(&store),
                cancel.child_token(),
            ));
        }
        if let Some(l) = recov_listener {
            tokio::spawn(listener::serve_state_transfer(
                l,
                Arc::clone(&store),
                cancel.child_token(),
            ));
        }
        if store.inner.log.lock().unwrap().persists_to_file() {
            applog::spawn_persister(store.inner.log.clone(), PERSIST_INTERVAL, cancel.child_token());
        }

        // Flush-and-release the log when the process-wide token cascades.
        let log = store.inner.log.clone();
        let flush_cancel = cancel.child_token();
        tokio::spawn(async move {
            flush_cancel.cancelled().await;
            if let Err(error) = log.lock().unwrap().close() {
                tracing::error!(%error, "application log close failed");
            }
        });

        Ok(store)
    }

    /// Open consensus on `bind_addr`. If `bootstrap` is set this node starts
    /// as the single member (and so leader) of a fresh cluster. Returns the
    /// transport's bound address.
    pub async fn start_consensus(&self, bootstrap: bool, bind_addr: &str) -> Result<SocketAddr> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local = listener.local_addr()?;

        let config = Arc::new(
            openraft::Config {
                cluster_name: "kv-cluster".to_string(),
                heartbeat_interval: 250,
                election_timeout_min: 1_000,
                election_timeout_max: 2_500,
                // Snapshotting is deliberately pushed past any realistic run.
                snapshot_policy: SnapshotPolicy::LogsSinceLast(u64::MAX),
                ..Default::default()
            }
            .validate()
            .map_err(|err| Error::Config(err.to_string()))?,
        );

        let storage = KvStorage::new(self.inner.clone());
        let (log_store, state_machine) = Adaptor::new(storage);
        let raft = Raft::new(self.node_id, config, Network, log_store, state_machine)
            .await
            .map_err(|err| Error::Consensus(err.to_string()))?;

        tokio::spawn(network::serve(
            listener,
            raft.clone(),
            self.cancel.child_token(),
        ));

        if bootstrap {
            let mut members = BTreeMap::new();
            members.insert(
                self.node_id,
                BasicNode {
                    addr: local.to_string(),
                },
            );
            if let Err(error) = raft.initialize(members).await {
                tracing::info!(%error, "consensus already initialized");
            }
        }

        let _ = self.raft.set(raft);
        let _ = self.raft_addr.set(local);
        Ok(local)
    }

    fn raft(&self) -> Result<&Raft> {
        self.raft
            .get()
            .ok_or_else(|| Error::Consensus("consensus not started".into()))
    }

    pub fn is_leader(&self) -> bool {
        self.raft
            .get()
            .map(|raft| raft.metrics().borrow().current_leader == Some(self.node_id))
            .unwrap_or(false)
    }

    pub fn raft_addr(&self) -> Option<SocketAddr> {
        self.raft_addr.get().copied()
    }

    pub fn join_handler_addr(&self) -> Option<SocketAddr> {
        self.join_addr
    }

    pub fn recov_handler_addr(&self) -> Option<SocketAddr> {
        self.recov_addr
    }

    /// Propose a raw command line through consensus. Not being leader is a
    /// silent no-op. On commit, the reply carries the client's UDP port and
    /// the raw payload bytes, and the `"OK: ..."` datagram goes out via
    /// `server` (absent in unit tests).
    pub async fn propose(
        &self,
        msg: Vec<u8>,
        server: Option<&Server>,
        client_ip: &str,
    ) -> Result<()> {
        if !self.is_leader() {
            return Ok(());
        }
        let raft = self.raft()?;

        let write = raft.client_write(Proposal { data: msg });
        let resp = tokio::time::timeout(self.inner.config().apply_timeout, write)
            .await
            .map_err(|_| Error::ApplyTimeout)?
            .map_err(|err| Error::Consensus(err.to_string()))?;

        match resp.data {
            Reply::Routed { port, payload } => {
                if let Some(server) = server {
                    let addr = format!("{client_ip}:{port}");
                    let mut datagram = b"OK: ".to_vec();
                    datagram.extend_from_slice(&payload);
                    datagram.push(b'\n');
                    server.send_udp(&addr, &datagram).await?;
                }
                Ok(())
            }
            Reply::Malformed(err) => Err(Error::Protocol(err)),
            Reply::None => Ok(()),
        }
    }

    /// Join `node_id` at `addr` to the cluster. Idempotent: an exact
    /// `(id, addr)` match is a no-op; a half-match evicts the stale member
    /// before the node is re-added.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn join(&self, node_id: &str, addr: &str, voter: bool) -> Result<()> {
        let raft = self.raft()?;
        let nid = node_id_from_str(node_id);

        let membership = raft.metrics().borrow().membership_config.clone();
        let mut stale: BTreeSet<NodeId> = BTreeSet::new();
        for (id, node) in membership.membership().nodes() {
            let id_matches = *id == nid;
            let addr_matches = node.addr == addr;
            if id_matches && addr_matches {
                tracing::debug!("node already a cluster member; ignoring join request");
                return Ok(());
            }
            if id_matches || addr_matches {
                stale.insert(*id);
            }
        }

        if !stale.is_empty() {
            let voter_ids: BTreeSet<NodeId> = membership.membership().voter_ids().collect();
            let stale_voters: BTreeSet<NodeId> =
                stale.iter().copied().filter(|id| voter_ids.contains(id)).collect();
            let stale_learners: BTreeSet<NodeId> =
                stale.iter().copied().filter(|id| !voter_ids.contains(id)).collect();

            if !stale_voters.is_empty() {
                raft.change_membership(ChangeMembers::RemoveVoters(stale_voters), false)
                    .await
                    .map_err(|err| Error::Consensus(err.to_string()))?;
            }
            if !stale_learners.is_empty() {
                raft.change_membership(ChangeMembers::RemoveNodes(stale_learners), false)
                    .await
                    .map_err(|err| Error::Consensus(err.to_string()))?;
            }
        }

        raft.add_learner(
            nid,
            BasicNode {
                addr: addr.to_string(),
            },
            true,
        )
        .await
        .map_err(|err| Error::Consensus(err.to_string()))?;

        if voter {
            raft.change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([nid])), false)
                .await
                .map_err(|err| Error::Consensus(err.to_string()))?;
        }

        tracing::debug!("node joined the cluster");
        Ok(())
    }

    /// Stream the application-log projection `[first, last]` into `sink`.
    /// Sharded strategies are prefixed with their log count.
    pub async fn transfer_state<W>(&self, first: u64, last: u64, sink: &mut W) -> Result<()>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        use tokio::io::AsyncWriteExt;

        let (logs, n_logs) = self
            .inner
            .log
            .lock()
            .unwrap()
            .recover_for_transfer(first, last)?;

        if n_logs > 0 {
            sink.write_all(format!("{n_logs}\n").as_bytes()).await?;
        }
        sink.write_all(&logs).await?;
        sink.flush().await?;
        Ok(())
    }

    /// Test-scaffolding read, outside consensus total order.
    pub fn test_get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.get(key)
    }

    /// Commands recorded in the application log so far.
    pub fn log_count(&self) -> u64 {
        self.inner.log_count()
    }

    /// Current cluster membership as `(node-id, address)` pairs.
    pub fn members(&self) -> Vec<(NodeId, String)> {
        let Some(raft) = self.raft.get() else {
            return Vec::new();
        };
        let membership = raft.metrics().borrow().membership_config.clone();
        membership
            .membership()
            .nodes()
            .map(|(id, node)| (*id, node.addr.clone()))
            .collect()
    }

    /// Poll until some node becomes leader, up to `timeout`.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId> {
        let raft = self.raft()?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = raft.metrics().borrow().current_leader {
                return Ok(leader);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Consensus("no leader elected within deadline".into()));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
