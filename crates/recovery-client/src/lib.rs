//! Recovery peer: fetches the application log from a healthy node and
//! replays it into an empty map, standing in for a replica rebuilding after
//! a catastrophic fault.

use applog::codec::{self, CodecError};
use applog::{Command, Operation};
use std::collections::HashMap;
use std::io::{BufRead, Cursor};

/// A mock replica map that transferred logs are installed into.
#[derive(Default)]
pub struct MockState {
    state: HashMap<String, Vec<u8>>,
}

impl MockState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a single framed log; returns the number of commands replayed.
    pub fn install(&mut self, transferred: &[u8]) -> Result<u64, CodecError> {
        let mut rd = Cursor::new(transferred);
        let cmds = codec::read_log(&mut rd)?;
        Ok(self.apply_log(cmds))
    }

    /// Install a sharded transfer: a `<nLogs>\n` line, then that many
    /// framed logs back to back.
    pub fn install_sharded(&mut self, transferred: &[u8]) -> Result<u64, CodecError> {
        let mut rd = Cursor::new(transferred);
        let mut header = String::new();
        rd.read_line(&mut header)?;
        let n_logs: usize = header
            .trim_end()
            .parse()
            .map_err(|_| CodecError::MalformedHeader(header.clone()))?;

        let mut total = 0;
        for _ in 0..n_logs {
            let cmds = codec::read_log(&mut rd)?;
            total += self.apply_log(cmds);
        }
        Ok(total)
    }

    fn apply_log(&mut self, cmds: Vec<Command>) -> u64 {
        let n = cmds.len() as u64;
        for cmd in cmds {
            if cmd.op() == Operation::Set {
                self.state.insert(cmd.key, cmd.value);
            }
        }
        n
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.state.get(key).map(|v| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }
}

/// Dial a node's state-transfer port and fetch the projection `[first, last]`.
/// The response is everything the peer writes before EOF.
pub async fn request_state(addr: &str, first: u64, last: u64) -> std::io::Result<Vec<u8>> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut conn = tokio::net::TcpStream::connect(addr).await?;
    let local = conn.local_addr()?;
    conn.write_all(format!("{local}-{first}-{last}\n").as_bytes())
        .await?;

    let mut received = Vec::new();
    conn.read_to_end(&mut received).await?;
    Ok(received)
}

#[cfg(test)]
mod test {
    use super::*;

    fn framed_log(entries: &[(u64, &str, &str)]) -> Vec<u8> {
        let cmds: Vec<Command> = entries
            .iter()
            .map(|(id, key, value)| {
                let mut cmd = Command::set(*key, value.as_bytes().to_vec());
                cmd.id = *id;
                cmd
            })
            .collect();
        codec::log_to_bytes(&cmds, 0, entries.len() as u64).unwrap()
    }

    #[test]
    fn install_replays_sets() {
        let mut replica = MockState::new();
        let n = replica
            .install(&framed_log(&[(1, "a", "1"), (2, "b", "2")]))
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(replica.get("a"), Some(b"1".as_slice()));
        assert_eq!(replica.len(), 2);
    }

    #[test]
    fn install_sharded_consumes_the_count_prefix() {
        let mut bytes = b"2\n".to_vec();
        bytes.extend(framed_log(&[(1, "a", "1")]));
        bytes.extend(framed_log(&[(2, "b", "2")]));

        let mut replica = MockState::new();
        let n = replica.install_sharded(&bytes).unwrap();
        assert_eq!(n, 2);
        assert_eq!(replica.get("b"), Some(b"2".as_slice()));
    }

    #[test]
    fn truncated_transfer_is_an_error() {
        let mut bytes = framed_log(&[(1, "a", "1")]);
        bytes.truncate(bytes.len() - 1);
        assert!(MockState::new().install(&bytes).is_err());
    }
}
