//! Embedded copy-on-write key-value store with snapshot-isolated, nestable
//! transactions, plus two stateless side surfaces: a flat single-file store
//! and read-only IP geolocation lookups.
//!
//! ```no_run
//! use emberdb::{DbFlags, EnvFlags, EnvOptions, Environment, WriteFlags};
//!
//! # fn main() -> emberdb::Result<()> {
//! let env = Environment::open(
//!     std::path::Path::new("/tmp/example-env"),
//!     EnvOptions::default(),
//!     EnvFlags::empty(),
//!     0o644,
//! )?;
//! let txn = env.begin_rw_txn()?;
//! let db = env.open_database(&txn, Some("catalog"), DbFlags::CREATE)?;
//! txn.put(&db, b"key", b"value", WriteFlags::empty())?;
//! txn.commit()?;
//! # Ok(())
//! # }
//! ```

mod btree;
mod constants;
mod cursor;
mod database;
mod env;
mod error;
mod flatstore;
mod geoip;
mod meta;
mod page;
mod transaction;

pub use constants::{
    DbFlags, EnvFlags, StoreFlags, TxnFlags, WriteFlags, DEFAULT_MAP_SIZE, DEFAULT_MAX_DBS,
    DEFAULT_MAX_READERS, MAX_KEY_SIZE, PAGE_SIZE,
};
pub use cursor::Cursor;
pub use database::Database;
pub use env::{EnvInfo, EnvOptions, Environment, DATA_FILE};
pub use error::{Error, Result};
pub use flatstore::{FlatStore, StoreKind};
pub use geoip::{Edition, GeoDb, GeoRecord};
pub use meta::Stat;
pub use transaction::Transaction;
