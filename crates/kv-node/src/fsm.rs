//! The state machine behind consensus, and its in-memory Raft storage.
//!
//! openraft traits use RPITIT, so the implementations below are plain
//! `async fn` rather than `#[async_trait]`. The combined v1 `RaftStorage`
//! is bridged through `openraft::storage::Adaptor` into the split
//! log-store/state-machine pair `Raft::new` expects.

use crate::config::StoreConfig;
use crate::raft::{NodeId, Reply, TypeConfig};
use applog::{codec, AppLog, Operation, StrategyKind};
use openraft::storage::{RaftLogReader, RaftSnapshotBuilder, RaftStorage};
use openraft::{
    BasicNode, Entry, EntryPayload, LogId, LogState, RaftLogId, Snapshot, SnapshotMeta,
    StorageError, StoredMembership, Vote,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::ops::RangeBounds;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// State shared between the consensus state machine and the store surface:
/// the map, the application log, and the applied-index counter.
pub struct StoreInner {
    map: RwLock<HashMap<String, Vec<u8>>>,
    pub(crate) log: Arc<Mutex<AppLog>>,
    applied: AtomicU64,
    config: StoreConfig,
}

impl StoreInner {
    pub fn new(config: StoreConfig, log: AppLog) -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            log: Arc::new(Mutex::new(log)),
            applied: AtomicU64::new(0),
            config,
        }
    }

    pub(crate) fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Commands recorded in the application log so far.
    pub fn log_count(&self) -> u64 {
        self.log.lock().unwrap().count()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.map.read().unwrap().get(key).cloned()
    }

    /// Fill the map with `keys` synthetic entries holding `value`.
    pub(crate) fn pre_populate(&self, keys: usize, value: Vec<u8>) {
        let mut map = self.map.write().unwrap();
        map.reserve(keys);
        for i in 0..keys {
            map.insert(i.to_string(), value.clone());
        }
    }

    /// Apply one committed command: mutate the map, record the command, and
    /// pair the client's UDP port with the raw reply payload. GETs flow
    /// through here too, so reads observe the consensus total order. The
    /// payload stays bytes end to end; stored values need not be UTF-8.
    pub(crate) fn apply_command(&self, raw: &[u8]) -> Reply {
        // Client lines arrive newline-terminated; the body is the frame.
        let body = raw.strip_suffix(b"\n").unwrap_or(raw);
        let cmd = match codec::decode_command(body) {
            Ok(cmd) => cmd,
            Err(err) => return Reply::Malformed(err.to_string()),
        };

        let idx = self.applied.fetch_add(1, Ordering::AcqRel) + 1;
        let payload = match cmd.op() {
            Operation::Set => {
                let value = if self.config.compress_values {
                    gzip(&cmd.value).expect("gzip into a memory buffer cannot fail")
                } else {
                    cmd.value.clone()
                };
                self.map.write().unwrap().insert(cmd.key.clone(), value);
                b"ack".to_vec()
            }
            Operation::Get => self
                .map
                .read()
                .unwrap()
                .get(&cmd.key)
                .cloned()
                .unwrap_or_default(),
        };
        let port = cmd.ip.clone();

        if self.config.effective_strategy() != StrategyKind::None {
            if let Err(error) = self.log.lock().unwrap().record(idx, cmd) {
                // The entry is already committed; the next recovery request
                // will surface the divergence.
                tracing::error!(%error, idx, "failed to record command in the application log");
            }
        }
        Reply::Routed { port, payload }
    }

    fn applied(&self) -> u64 {
        self.applied.load(Ordering::Acquire)
    }

    fn restore(&self, applied: u64, map: HashMap<String, Vec<u8>>) {
        *self.map.write().unwrap() = map;
        self.applied.store(applied, Ordering::Release);
    }
}

pub(crate) fn gzip(value: &[u8]) -> std::io::Result<Vec<u8>> {
    use std::io::Write as _;
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(value)?;
    enc.finish()
}

#[derive(Serialize, Deserialize)]
struct SnapshotBody {
    applied: u64,
    map: HashMap<String, Vec<u8>>,
}

/// In-memory combined Raft storage over the shared store state.
pub struct KvStorage {
    inner: Arc<StoreInner>,
    vote: Option<Vote<NodeId>>,
    log: BTreeMap<u64, Entry<TypeConfig>>,
    committed: Option<LogId<NodeId>>,
    last_purged: Option<LogId<NodeId>>,
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
    snapshot: Option<Snapshot<TypeConfig>>,
}

impl KvStorage {
    pub fn new(inner: Arc<StoreInner>) -> Self {
        Self {
            inner,
            vote: None,
            log: BTreeMap::new(),
            committed: None,
            last_purged: None,
            last_applied: None,
            last_membership: StoredMembership::default(),
            snapshot: None,
        }
    }
}

impl RaftLogReader<TypeConfig> for KvStorage {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

/// Log reader over a point-in-time copy of the log.
pub struct KvLogReader {
    log: BTreeMap<u64, Entry<TypeConfig>>,
}

impl RaftLogReader<TypeConfig> for KvLogReader {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

/// Serializes the full map. The snapshot policy keeps this from running in
/// any realistic deployment; it exists so membership catch-up stays correct.
pub struct KvSnapshotBuilder {
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
    body: Vec<u8>,
}

impl RaftSnapshotBuilder<TypeConfig> for KvSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let snapshot_id = self
            .last_applied
            .map(|log_id| log_id.to_string())
            .unwrap_or_else(|| "empty".to_string());

        Ok(Snapshot {
            meta: SnapshotMeta {
                last_log_id: self.last_applied,
                last_membership: self.last_membership.clone(),
                snapshot_id,
            },
            snapshot: Box::new(Cursor::new(std::mem::take(&mut self.body))),
        })
    }
}

impl RaftStorage<TypeConfig> for KvStorage {
    type LogReader = KvLogReader;
    type SnapshotBuilder = KvSnapshotBuilder;

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.vote = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        Ok(self.vote)
    }

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last = self.log.values().next_back().map(|e| *e.get_log_id());
        Ok(LogState {
            last_purged_log_id: self.last_purged,
            last_log_id: last,
        })
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        self.committed = committed;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        Ok(self.committed)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        KvLogReader {
            log: self.log.clone(),
        }
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        for entry in entries {
            self.log.insert(entry.get_log_id().index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> Result<(), StorageError<NodeId>> {
        self.log.retain(|&idx, _| idx < log_id.index);
        Ok(())
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.log.retain(|&idx, _| idx > log_id.index);
        self.last_purged = Some(log_id);
        Ok(())
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>>
    {
        Ok((self.last_applied, self.last_membership.clone()))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<Reply>, StorageError<NodeId>> {
        let mut replies = Vec::with_capacity(entries.len());

        for entry in entries {
            self.last_applied = Some(*entry.get_log_id());

            match &entry.payload {
                EntryPayload::Blank => replies.push(Reply::None),
                EntryPayload::Normal(proposal) => {
                    replies.push(self.inner.apply_command(&proposal.data));
                }
                EntryPayload::Membership(m) => {
                    self.last_membership =
                        StoredMembership::new(Some(*entry.get_log_id()), m.clone());
                    replies.push(Reply::None);
                }
            }
        }

        Ok(replies)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        let body = SnapshotBody {
            applied: self.inner.applied(),
            map: self.inner.map.read().unwrap().clone(),
        };
        KvSnapshotBuilder {
            last_applied: self.last_applied,
            last_membership: self.last_membership.clone(),
            body: serde_json::to_vec(&body).unwrap_or_default(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        if let Ok(body) = serde_json::from_slice::<SnapshotBody>(snapshot.get_ref()) {
            self.inner.restore(body.applied, body.map);
        }
        self.last_applied = meta.last_log_id;
        self.last_membership = meta.last_membership.clone();
        self.snapshot = Some(Snapshot {
            meta: meta.clone(),
            snapshot,
        });
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        Ok(self.snapshot.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use applog::{Command, LogConfig};
    use std::io::BufReader;

    fn inner(config: StoreConfig) -> StoreInner {
        let log = AppLog::new(config.effective_strategy(), &config.log_config()).unwrap();
        StoreInner::new(config, log)
    }

    fn encoded(cmd: &Command) -> Vec<u8> {
        let mut line = codec::encode_command(cmd);
        line.push(b'\n');
        line
    }

    #[test]
    fn set_then_get_observes_the_write() {
        let inner = inner(StoreConfig {
            node_id: "node0".into(),
            strategy: StrategyKind::InmemTrad,
            ..Default::default()
        });

        let mut set = Command::set("foo", b"bar".to_vec());
        set.ip = "9000".into();
        let reply = inner.apply_command(&encoded(&set));
        assert!(
            matches!(reply, Reply::Routed { port, payload } if port == "9000" && payload == b"ack")
        );

        let mut get = Command::get("foo");
        get.ip = "9000".into();
        let reply = inner.apply_command(&encoded(&get));
        assert!(
            matches!(reply, Reply::Routed { port, payload } if port == "9000" && payload == b"bar")
        );

        assert_eq!(inner.get("foo"), Some(b"bar".to_vec()));
        assert_eq!(inner.log_count(), 2);
    }

    #[test]
    fn absent_key_reads_empty() {
        let inner = inner(StoreConfig {
            node_id: "node0".into(),
            strategy: StrategyKind::None,
            ..Default::default()
        });
        let mut get = Command::get("missing");
        get.ip = "7".into();
        let reply = inner.apply_command(&encoded(&get));
        assert!(
            matches!(reply, Reply::Routed { port, payload } if port == "7" && payload.is_empty())
        );
    }

    #[test]
    fn get_reply_carries_stored_bytes_verbatim() {
        let inner = inner(StoreConfig {
            node_id: "node0".into(),
            strategy: StrategyKind::None,
            ..Default::default()
        });

        // Not valid UTF-8 under any reading; a lossy conversion would
        // mangle it.
        let raw = vec![0xff, 0x00, 0xfe, 0x21];
        let set = Command::set("blob", raw.clone());
        inner.apply_command(&encoded(&set));

        let mut get = Command::get("blob");
        get.ip = "9000".into();
        let Reply::Routed { payload, .. } = inner.apply_command(&encoded(&get)) else {
            panic!("expected a routed reply");
        };
        assert_eq!(payload, raw);
    }

    #[test]
    fn get_reply_matches_compressed_storage() {
        let inner = inner(StoreConfig {
            node_id: "node0".into(),
            strategy: StrategyKind::None,
            compress_values: true,
            ..Default::default()
        });
        let set = Command::set("k", vec![b'!'; 256]);
        inner.apply_command(&encoded(&set));
        let stored = inner.get("k").unwrap();

        // The reply payload is the gzipped stored value, byte for byte.
        let mut get = Command::get("k");
        get.ip = "9000".into();
        let Reply::Routed { payload, .. } = inner.apply_command(&encoded(&get)) else {
            panic!("expected a routed reply");
        };
        assert_eq!(payload, stored);
    }

    #[test]
    fn malformed_entry_is_a_distinguished_error() {
        let inner = inner(StoreConfig {
            node_id: "node0".into(),
            strategy: StrategyKind::None,
            ..Default::default()
        });
        let reply = inner.apply_command(b"\xff\xff\xff not a command\n");
        assert!(matches!(reply, Reply::Malformed(_)));
    }

    #[test]
    fn compressed_values_land_gzipped() {
        let inner = inner(StoreConfig {
            node_id: "node0".into(),
            strategy: StrategyKind::None,
            compress_values: true,
            ..Default::default()
        });
        let set = Command::set("k", vec![b'!'; 256]);
        inner.apply_command(&encoded(&set));

        let stored = inner.get("k").unwrap();
        assert_ne!(stored, vec![b'!'; 256]);

        use std::io::Read as _;
        let mut decoder = flate2::read::GzDecoder::new(stored.as_slice());
        let mut plain = Vec::new();
        decoder.read_to_end(&mut plain).unwrap();
        assert_eq!(plain, vec![b'!'; 256]);
    }

    #[test]
    fn applied_commands_are_recorded_with_monotone_indices() {
        let inner = inner(StoreConfig {
            node_id: "node0".into(),
            strategy: StrategyKind::InmemTrad,
            ..Default::default()
        });
        for i in 0..5 {
            let cmd = Command::set(format!("k{i}"), b"v".to_vec());
            inner.apply_command(&encoded(&cmd));
        }

        let bytes = inner.log.lock().unwrap().recover_range(0, 5).unwrap();
        let cmds = codec::read_log(&mut BufReader::new(bytes.as_slice())).unwrap();
        assert_eq!(cmds.iter().map(|c| c.id).collect::<Vec<_>>(), [1, 2, 3, 4, 5]);
    }

    #[test]
    fn pre_population_fills_synthetic_keys() {
        let config = StoreConfig {
            node_id: "node0".into(),
            strategy: StrategyKind::None,
            ..Default::default()
        };
        let log = AppLog::new(config.effective_strategy(), &LogConfig::default()).unwrap();
        let inner = StoreInner::new(config, log);
        inner.pre_populate(100, vec![b'!'; 8]);

        assert_eq!(inner.get("0"), Some(vec![b'!'; 8]));
        assert_eq!(inner.get("99"), Some(vec![b'!'; 8]));
        assert_eq!(inner.get("100"), None);
    }
}
