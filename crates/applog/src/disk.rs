//! Traditional append-only disk log.

use crate::codec;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Appends every committed command, length-prefixed, to a single file.
///
/// The file starts with the `first\nlast\ncount\n` header where the count is
/// the `-1` placeholder; the true frame count lives in an atomic counter
/// incremented only after a successful write, and readers pass it to
/// [`codec::read_log_with_len`]. Callers must serialize `record` against
/// `recover_range`; the store does so with a single lock.
pub struct DiskLog {
    file: File,
    fname: PathBuf,
    frames: AtomicU64,
}

impl DiskLog {
    /// Create the log file, truncating any previous run's content. The file
    /// is opened create+truncate, write-only, append; `sync_writes` adds
    /// `O_SYNC` for catastrophic fault models.
    pub fn create(fname: PathBuf, sync_writes: bool) -> crate::Result<Self> {
        use std::os::unix::fs::OpenOptionsExt;

        // O_APPEND rides in custom_flags: OpenOptions rejects its own
        // append(true) combined with truncate(true), but the open(2) flags
        // compose fine.
        let mut flags = libc::O_APPEND;
        if sync_writes {
            flags |= libc::O_SYNC;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .custom_flags(flags)
            .open(&fname)?;
        write!(file, "{}\n{}\n{}\n", 0, 0, -1)?;

        Ok(Self {
            file,
            fname,
            frames: AtomicU64::new(0),
        })
    }

    pub fn record(&mut self, idx: u64, mut cmd: crate::Command) -> crate::Result<()> {
        cmd.id = idx;
        let mut buf = Vec::new();
        codec::push_frame(&cmd, &mut buf);
        self.file.write_all(&buf)?;
        self.frames.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Frames successfully written so far.
    pub fn count(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    /// Re-read the file and marshal the `[first, last]` projection.
    pub fn recover_range(&self, first: u64, last: u64) -> crate::Result<Vec<u8>> {
        let count = self.count();
        let mut rd = BufReader::new(File::open(&self.fname)?);
        let cmds = codec::read_log_with_len(&mut rd, count as usize)?;
        let cmds = codec::retain_log_interval(&cmds, first, last);
        Ok(codec::log_to_bytes(&cmds, first, last)?)
    }

    pub fn path(&self) -> &PathBuf {
        &self.fname
    }

    pub fn close(&mut self) -> crate::Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}
