//! Reducing log structures.
//!
//! Each structure collapses repeated writes to the same key into a single
//! retained entry: the one with the largest index folded so far. A later SET
//! supersedes an earlier GET; keys that were only ever read are dropped here
//! (the sharded table keeps them as presence markers instead). Records stage
//! in a pending buffer and fold into the structure according to the
//! configured [`Tick`]; recovery always folds outstanding records first, so
//! the emitted projection reflects every recorded command.

use crate::codec;
use crate::{Command, Operation, Tick};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;

pub(crate) struct Staging {
    tick: Tick,
    period: usize,
    pending: Vec<Command>,
}

impl Staging {
    pub(crate) fn new(tick: Tick, period: usize) -> Self {
        Self {
            tick,
            period: period.max(1),
            pending: Vec::new(),
        }
    }

    /// Stage one record; returns true when a fold is due.
    pub(crate) fn stage(&mut self, cmd: Command) -> bool {
        self.pending.push(cmd);
        match self.tick {
            Tick::Immediate => true,
            Tick::Interval => self.pending.len() >= self.period,
            Tick::Delayed => false,
        }
    }

    pub(crate) fn drain(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.pending)
    }
}

/// Reducing list: a retained entry keeps the slot of its key's first write,
/// so recovery emits keys in first-insertion order.
pub struct ListLog {
    staging: Staging,
    entries: Vec<Command>,
    slots: HashMap<String, usize>,
}

impl ListLog {
    pub fn new(tick: Tick, period: usize) -> Self {
        Self {
            staging: Staging::new(tick, period),
            entries: Vec::new(),
            slots: HashMap::new(),
        }
    }

    pub fn record(&mut self, idx: u64, mut cmd: Command) {
        cmd.id = idx;
        if self.staging.stage(cmd) {
            self.fold();
        }
    }

    fn fold(&mut self) {
        for cmd in self.staging.drain() {
            if cmd.op() != Operation::Set {
                continue;
            }
            match self.slots.get(&cmd.key) {
                Some(&slot) => self.entries[slot] = cmd,
                None => {
                    self.slots.insert(cmd.key.clone(), self.entries.len());
                    self.entries.push(cmd);
                }
            }
        }
    }

    pub fn recover_range(&mut self, first: u64, last: u64) -> crate::Result<Vec<u8>> {
        self.fold();
        let cmds = codec::retain_log_interval(&self.entries, first, last);
        Ok(codec::log_to_bytes(&cmds, first, last)?)
    }
}

/// Reducing array: a flat buffer compacted on every fold; recovery emits the
/// retained entries in ascending index order.
pub struct ArrayLog {
    staging: Staging,
    entries: Vec<Command>,
}

impl ArrayLog {
    pub fn new(tick: Tick, period: usize) -> Self {
        Self {
            staging: Staging::new(tick, period),
            entries: Vec::new(),
        }
    }

    pub fn record(&mut self, idx: u64, mut cmd: Command) {
        cmd.id = idx;
        if self.staging.stage(cmd) {
            self.fold();
        }
    }

    fn fold(&mut self) {
        self.entries.extend(
            self.staging
                .drain()
                .into_iter()
                .filter(|cmd| cmd.op() == Operation::Set),
        );

        let mut latest: HashMap<String, Command> = HashMap::with_capacity(self.entries.len());
        for cmd in self.entries.drain(..) {
            match latest.get(&cmd.key) {
                Some(kept) if kept.id > cmd.id => {}
                _ => {
                    latest.insert(cmd.key.clone(), cmd);
                }
            }
        }
        let mut entries: Vec<Command> = latest.into_values().collect();
        entries.sort_by_key(|cmd| cmd.id);
        self.entries = entries;
    }

    pub fn recover_range(&mut self, first: u64, last: u64) -> crate::Result<Vec<u8>> {
        self.fold();
        let cmds = codec::retain_log_interval(&self.entries, first, last);
        Ok(codec::log_to_bytes(&cmds, first, last)?)
    }
}

/// Ordered-tree rendition of the balanced-tree reducing log: nodes keyed by
/// command index, with a key index for supersession. An in-order walk yields
/// ascending indices, which is the emission order.
pub struct AvlLog {
    staging: Staging,
    tree: BTreeMap<u64, Command>,
    index: HashMap<String, u64>,
}

impl AvlLog {
    pub fn new(tick: Tick, period: usize) -> Self {
        Self {
            staging: Staging::new(tick, period),
            tree: BTreeMap::new(),
            index: HashMap::new(),
        }
    }

    pub fn record(&mut self, idx: u64, mut cmd: Command) {
        cmd.id = idx;
        if self.staging.stage(cmd) {
            self.fold();
        }
    }

    fn fold(&mut self) {
        for cmd in self.staging.drain() {
            if cmd.op() != Operation::Set {
                continue;
            }
            if let Some(old) = self.index.insert(cmd.key.clone(), cmd.id) {
                self.tree.remove(&old);
            }
            self.tree.insert(cmd.id, cmd);
        }
    }

    pub fn recover_range(&mut self, first: u64, last: u64) -> crate::Result<Vec<u8>> {
        self.fold();
        let cmds: Vec<Command> = self
            .tree
            .range(first..=last)
            .map(|(_, cmd)| cmd.clone())
            .collect();
        Ok(codec::log_to_bytes(&cmds, first, last)?)
    }
}

/// Fixed-capacity ring of per-key cells. An update lands in its key's
/// existing cell; a new key claims the next slot, evicting whatever held it.
/// Recovery emits cells oldest-to-newest. Optionally flushes its reduced
/// view to a file (see [`crate::AppLog::persist`]).
pub struct CircBuffLog {
    staging: Staging,
    cells: Vec<Option<Command>>,
    slots: HashMap<String, usize>,
    head: usize,
    fname: Option<PathBuf>,
}

impl CircBuffLog {
    pub fn new(tick: Tick, period: usize, capacity: usize, fname: Option<PathBuf>) -> Self {
        Self {
            staging: Staging::new(tick, period),
            cells: vec![None; capacity.max(1)],
            slots: HashMap::new(),
            head: 0,
            fname,
        }
    }

    pub fn record(&mut self, idx: u64, mut cmd: Command) {
        cmd.id = idx;
        if self.staging.stage(cmd) {
            self.fold();
        }
    }

    fn fold(&mut self) {
        for cmd in self.staging.drain() {
            if cmd.op() != Operation::Set {
                continue;
            }
            if let Some(&slot) = self.slots.get(&cmd.key) {
                self.cells[slot] = Some(cmd);
                continue;
            }
            let slot = self.head;
            if let Some(evicted) = self.cells[slot].take() {
                self.slots.remove(&evicted.key);
            }
            self.slots.insert(cmd.key.clone(), slot);
            self.cells[slot] = Some(cmd);
            self.head = (slot + 1) % self.cells.len();
        }
    }

    fn view(&mut self) -> Vec<Command> {
        self.fold();
        let len = self.cells.len();
        let mut out: VecDeque<Command> = VecDeque::with_capacity(self.slots.len());
        for offset in 0..len {
            if let Some(cmd) = &self.cells[(self.head + offset) % len] {
                out.push_back(cmd.clone());
            }
        }
        out.into()
    }

    pub fn recover_range(&mut self, first: u64, last: u64) -> crate::Result<Vec<u8>> {
        let cmds = codec::retain_log_interval(&self.view(), first, last);
        Ok(codec::log_to_bytes(&cmds, first, last)?)
    }

    /// Flush the current reduced view to the configured file, if any.
    pub fn persist(&mut self) -> crate::Result<()> {
        let Some(fname) = self.fname.clone() else {
            return Ok(());
        };
        let cmds = self.view();
        let (first, last) = index_bounds(&cmds);
        let mut file = std::fs::File::create(fname)?;
        codec::write_log(&mut file, &cmds, first, last)?;
        file.flush()?;
        Ok(())
    }

    pub fn persists_to_file(&self) -> bool {
        self.fname.is_some()
    }
}

pub(crate) fn index_bounds(cmds: &[Command]) -> (u64, u64) {
    let first = cmds.iter().map(|cmd| cmd.id).min().unwrap_or(0);
    let last = cmds.iter().map(|cmd| cmd.id).max().unwrap_or(0);
    (first, last)
}
