//! Traditional in-memory log: every command, in commit order.

use crate::codec;
use crate::Command;

/// The caller's lock guards both append and recovery extraction.
#[derive(Default)]
pub struct InmemLog {
    cmds: Vec<Command>,
}

impl InmemLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, idx: u64, mut cmd: Command) {
        cmd.id = idx;
        self.cmds.push(cmd);
    }

    pub fn recover_range(&self, first: u64, last: u64) -> crate::Result<Vec<u8>> {
        let cmds = codec::retain_log_interval(&self.cmds, first, last);
        Ok(codec::log_to_bytes(&cmds, first, last)?)
    }
}
