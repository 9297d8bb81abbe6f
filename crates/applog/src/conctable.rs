//! Shard-partitioned reducing table.

use crate::codec;
use crate::reduce::index_bounds;
use crate::{Command, Operation, Tick};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// `shards` independent reducing hash tables, selected by key hash.
///
/// Unlike the other reducing structures, `record` may be called concurrently:
/// each shard takes its own lock. This is also the only strategy that serves
/// whole-state recovery, emitting every shard at once; keys that were only
/// ever read survive as empty-value presence markers.
pub struct ConcTable {
    shards: Vec<Mutex<Shard>>,
    fname: Option<PathBuf>,
}

struct Shard {
    tick: Tick,
    period: usize,
    staging: Vec<Command>,
    table: HashMap<String, Command>,
}

impl ConcTable {
    pub fn new(shards: usize, tick: Tick, period: usize, fname: Option<PathBuf>) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| {
                Mutex::new(Shard {
                    tick,
                    period: period.max(1),
                    staging: Vec::new(),
                    table: HashMap::new(),
                })
            })
            .collect();
        Self { shards, fname }
    }

    pub fn n_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn record(&self, idx: u64, mut cmd: Command) {
        cmd.id = idx;
        let mut shard = self.shards[self.shard_of(&cmd.key)].lock().unwrap();
        shard.staging.push(cmd);
        let fold = match shard.tick {
            Tick::Immediate => true,
            Tick::Interval => shard.staging.len() >= shard.period,
            Tick::Delayed => false,
        };
        if fold {
            shard.fold();
        }
    }

    /// Marshal the merged `[first, last]` projection across every shard.
    pub fn recover_range(&self, first: u64, last: u64) -> crate::Result<Vec<u8>> {
        let mut cmds = Vec::new();
        for shard in &self.shards {
            cmds.extend(shard.lock().unwrap().view());
        }
        cmds.sort_by_key(|cmd| cmd.id);
        let cmds = codec::retain_log_interval(&cmds, first, last);
        Ok(codec::log_to_bytes(&cmds, first, last)?)
    }

    /// Marshal every shard as its own framed log, in shard-id order.
    /// Returns the concatenated bodies and the shard count; the transfer
    /// protocol prefixes the stream with that count.
    pub fn recover_all(&self) -> crate::Result<(Vec<u8>, usize)> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let cmds = shard.lock().unwrap().view();
            let (first, last) = index_bounds(&cmds);
            codec::write_log(&mut out, &cmds, first, last)?;
        }
        Ok((out, self.shards.len()))
    }

    /// Flush each shard's reduced view to `<fname>.<shard>`, if configured.
    pub fn persist(&self) -> crate::Result<()> {
        let Some(fname) = &self.fname else {
            return Ok(());
        };
        for (i, shard) in self.shards.iter().enumerate() {
            let cmds = shard.lock().unwrap().view();
            let (first, last) = index_bounds(&cmds);
            let mut path = fname.as_os_str().to_owned();
            path.push(format!(".{i}"));
            let mut file = std::fs::File::create(PathBuf::from(path))?;
            codec::write_log(&mut file, &cmds, first, last)?;
            file.flush()?;
        }
        Ok(())
    }

    pub fn persists_to_file(&self) -> bool {
        self.fname.is_some()
    }

    fn shard_of(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }
}

impl Shard {
    fn fold(&mut self) {
        for mut cmd in self.staging.drain(..) {
            match cmd.op() {
                Operation::Set => {
                    let keep = match self.table.get(&cmd.key) {
                        Some(kept) if kept.id > cmd.id => false,
                        _ => true,
                    };
                    if keep {
                        self.table.insert(cmd.key.clone(), cmd);
                    }
                }
                Operation::Get => {
                    // Presence marker; never displaces a retained SET.
                    if !self.table.contains_key(&cmd.key) {
                        cmd.value.clear();
                        self.table.insert(cmd.key.clone(), cmd);
                    }
                }
            }
        }
    }

    fn view(&mut self) -> Vec<Command> {
        self.fold();
        let mut cmds: Vec<Command> = self.table.values().cloned().collect();
        cmds.sort_by_key(|cmd| cmd.id);
        cmds
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::BufReader;

    #[test]
    fn whole_state_recovery_reconstructs_the_map() {
        let table = ConcTable::new(4, Tick::Interval, 100, None);
        for i in 0..1000u64 {
            table.record(i + 1, Command::set(format!("key-{i}"), i.to_string().into_bytes()));
        }

        let (bytes, n_logs) = table.recover_all().unwrap();
        assert_eq!(n_logs, 4);

        let mut rd = BufReader::new(bytes.as_slice());
        let mut replayed: HashMap<String, Vec<u8>> = HashMap::new();
        for _ in 0..n_logs {
            for cmd in codec::read_log(&mut rd).unwrap() {
                replayed.insert(cmd.key, cmd.value);
            }
        }
        assert_eq!(replayed.len(), 1000);
        assert_eq!(replayed["key-123"], b"123");
    }

    #[test]
    fn shards_reduce_independently() {
        let table = ConcTable::new(2, Tick::Immediate, 1, None);
        table.record(1, Command::set("k", b"1".to_vec()));
        table.record(2, Command::set("k", b"2".to_vec()));

        let bytes = table.recover_range(0, 2).unwrap();
        let cmds = codec::read_log(&mut BufReader::new(bytes.as_slice())).unwrap();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].value, b"2");
    }

    #[test]
    fn get_only_keys_survive_as_presence_markers() {
        let table = ConcTable::new(2, Tick::Immediate, 1, None);
        table.record(1, Command::get("seen"));
        table.record(2, Command::set("written", b"v".to_vec()));
        table.record(3, Command::get("written"));

        let bytes = table.recover_range(0, 3).unwrap();
        let cmds = codec::read_log(&mut BufReader::new(bytes.as_slice())).unwrap();
        assert_eq!(cmds.len(), 2);

        let seen = cmds.iter().find(|c| c.key == "seen").unwrap();
        assert_eq!(seen.op(), Operation::Get);
        assert!(seen.value.is_empty());

        // The SET was not displaced by the later GET.
        let written = cmds.iter().find(|c| c.key == "written").unwrap();
        assert_eq!(written.op(), Operation::Set);
        assert_eq!(written.value, b"v");
    }
}
