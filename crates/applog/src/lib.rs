//! The application-level command log.
//!
//! Every command committed through consensus is also recorded here, in a
//! structure chosen at startup. Traditional strategies keep the full command
//! sequence (on disk or in memory); reducing strategies collapse repeated
//! writes to the same key down to one retained entry, trading recovery
//! completeness for a much smaller state-transfer payload.

pub mod codec;

mod command;
mod conctable;
mod disk;
mod inmem;
mod reduce;
mod strategy;

pub use command::{Command, Operation};
pub use conctable::ConcTable;
pub use disk::DiskLog;
pub use inmem::InmemLog;
pub use reduce::{ArrayLog, AvlLog, CircBuffLog, ListLog};
pub use strategy::{spawn_persister, AppLog, LogConfig, StrategyKind, Tick};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot recover the application log of a non-logged store")]
    NotLogged,
    #[error("invalid recovery interval [{first}, {last}]")]
    InvalidInterval { first: u64, last: u64 },
    #[error("the disk log strategy requires a target file path")]
    MissingLogFile,
    #[error(transparent)]
    Codec(#[from] codec::CodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
