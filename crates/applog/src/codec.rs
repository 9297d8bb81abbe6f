//! Wire codec for [`Command`] records and framed command logs.
//!
//! A framed log is three ASCII integer header lines, `first\nlast\ncount\n`,
//! followed by `count` records. Each record is a big-endian `u32` length
//! prefix and the protobuf-encoded command body. The disk append log writes
//! a `-1` placeholder on the count line, because its count is only known once
//! appending stops; readers of that file supply the count themselves.

use crate::Command;
use prost::Message;
use std::io::{BufRead, Read, Write};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unexpected end of log stream")]
    UnexpectedEof,
    #[error("malformed log header line {0:?}")]
    MalformedHeader(String),
    #[error("failed to decode command frame")]
    Decode(#[from] prost::DecodeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub fn encode_command(cmd: &Command) -> Vec<u8> {
    cmd.encode_to_vec()
}

pub fn decode_command(buf: &[u8]) -> Result<Command, CodecError> {
    Ok(Command::decode(buf)?)
}

/// Append a length-prefixed frame for `cmd` onto `buf`.
pub fn push_frame(cmd: &Command, buf: &mut Vec<u8>) {
    let len = cmd.encoded_len();
    buf.reserve(4 + len);
    buf.extend_from_slice(&(len as u32).to_be_bytes());
    cmd.encode(buf).expect("buf has pre-allocated capacity");
}

/// Write a framed log: the three-line header, then every command.
pub fn write_log<W: Write>(
    w: &mut W,
    cmds: &[Command],
    first: u64,
    last: u64,
) -> Result<(), CodecError> {
    write!(w, "{first}\n{last}\n{}\n", cmds.len())?;
    let mut buf = Vec::new();
    for cmd in cmds {
        buf.clear();
        push_frame(cmd, &mut buf);
        w.write_all(&buf)?;
    }
    Ok(())
}

/// Marshal a framed log into a fresh byte buffer.
pub fn log_to_bytes(cmds: &[Command], first: u64, last: u64) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    write_log(&mut out, cmds, first, last)?;
    Ok(out)
}

/// Read a framed log, taking the record count from its header.
pub fn read_log<R: BufRead>(r: &mut R) -> Result<Vec<Command>, CodecError> {
    let (_, _, count) = read_header(r)?;
    let count =
        usize::try_from(count).map_err(|_| CodecError::MalformedHeader(count.to_string()))?;
    read_frames(r, count)
}

/// Read a framed log whose record count is supplied by the caller. The three
/// header lines are still consumed; this is the reader for the disk append
/// log, whose header carries the `-1` placeholder count.
pub fn read_log_with_len<R: BufRead>(r: &mut R, count: usize) -> Result<Vec<Command>, CodecError> {
    let _ = read_header(r)?;
    read_frames(r, count)
}

/// Parse the `first\nlast\ncount\n` header. The count may be `-1`.
pub fn read_header<R: BufRead>(r: &mut R) -> Result<(u64, u64, i64), CodecError> {
    let first = read_header_line(r)?;
    let last = read_header_line(r)?;
    let count = read_header_line(r)?;
    match (u64::try_from(first), u64::try_from(last)) {
        (Ok(first), Ok(last)) => Ok((first, last, count)),
        _ => Err(CodecError::MalformedHeader(format!("{first} {last}"))),
    }
}

/// Retain only the commands whose index falls within `[first, last]`.
pub fn retain_log_interval(cmds: &[Command], first: u64, last: u64) -> Vec<Command> {
    cmds.iter()
        .filter(|cmd| cmd.id >= first && cmd.id <= last)
        .cloned()
        .collect()
}

fn read_header_line<R: BufRead>(r: &mut R) -> Result<i64, CodecError> {
    let mut line = String::new();
    if r.read_line(&mut line)? == 0 {
        return Err(CodecError::UnexpectedEof);
    }
    line.trim_end_matches('\n')
        .parse::<i64>()
        .map_err(|_| CodecError::MalformedHeader(line.clone()))
}

fn read_frames<R: BufRead>(r: &mut R, count: usize) -> Result<Vec<Command>, CodecError> {
    let mut cmds = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        cmds.push(read_frame(r)?);
    }
    Ok(cmds)
}

fn read_frame<R: Read>(r: &mut R) -> Result<Command, CodecError> {
    let mut len = [0u8; 4];
    fill(r, &mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    let mut body = vec![0u8; len];
    fill(r, &mut body)?;
    Ok(Command::decode(body.as_slice())?)
}

fn fill<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<(), CodecError> {
    r.read_exact(buf).map_err(|err| match err.kind() {
        std::io::ErrorKind::UnexpectedEof => CodecError::UnexpectedEof,
        _ => CodecError::Io(err),
    })
}
