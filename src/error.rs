use std::io;
use std::result;

use thiserror::Error;

/// Custom result type for emberdb operations
pub type Result<T> = result::Result<T, Error>;

/// emberdb error kinds
#[derive(Debug, Error)]
pub enum Error {
    /// No matching key/data pair found
    #[error("no matching key/data pair found")]
    NotFound,
    /// Key/data pair already exists
    #[error("key/data pair already exists")]
    KeyExist,
    /// Another read-write transaction is active on this lineage
    #[error("another read-write transaction is active on this lineage")]
    WriterConflict,
    /// Parent transaction is not active
    #[error("parent transaction is not active")]
    ParentNotActive,
    /// Transaction still has active children
    #[error("transaction still has active children")]
    TxnHasChild,
    /// Environment mapsize limit reached
    #[error("environment mapsize limit reached")]
    MapFull,
    /// Environment has open transactions
    #[error("environment still has open transactions")]
    TxnsStillOpen,
    /// Database file is corrupted
    #[error("database file is corrupted")]
    Corrupted,
    /// Database format version mismatch
    #[error("database format version mismatch")]
    VersionMismatch,
    /// Unsupported size of key or data
    #[error("unsupported size of key or data")]
    BadValSize,
    /// Environment maxdbs limit reached
    #[error("environment maxdbs limit reached")]
    DbsFull,
    /// Environment maxreaders limit reached
    #[error("environment maxreaders limit reached")]
    ReadersFull,
    /// Operation and database are incompatible
    #[error("operation and database are incompatible")]
    Incompatible,
    /// Environment is closed
    #[error("environment is closed")]
    EnvClosed,
    /// Environment is read-only
    #[error("environment is read-only")]
    EnvReadOnly,
    /// Transaction already finished
    #[error("transaction already finished")]
    TxnFinished,
    /// Operation not allowed in a read-only transaction
    #[error("operation not allowed in a read-only transaction")]
    TxnReadOnly,
    /// Database handle is closed
    #[error("database handle is closed")]
    DbClosed,
    /// Requested page not found
    #[error("requested page not found")]
    PageNotFound,
    /// Host name could not be resolved to an address
    #[error("host name could not be resolved to an address")]
    InvalidHost,
    /// Underlying I/O failure
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}
