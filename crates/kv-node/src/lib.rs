//! A replicated in-memory key-value node.
//!
//! State-changing commands flow through leader-based consensus into the
//! state machine, which mutates the map, records the command in the
//! application-level log ([`applog`]), and hands a routed reply back to the
//! proposing node for the UDP fan-out. Side listeners serve cluster joins and
//! state-transfer requests for catastrophic-recovery peers.

pub mod config;
pub mod fsm;
pub mod listener;
pub mod network;
pub mod raft;
pub mod server;
pub mod session;
pub mod store;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Network(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] applog::codec::CodecError),
    #[error("consensus rejected the request: {0}")]
    Consensus(String),
    #[error("proposal timed out awaiting commit")]
    ApplyTimeout,
    #[error(transparent)]
    Storage(#[from] applog::Error),
    #[error("malformed request: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, Error>;
