use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::constants::{
    DbFlags, EnvFlags, TxnFlags, DEFAULT_MAP_SIZE, DEFAULT_MAX_DBS, DEFAULT_MAX_READERS,
};
use crate::database::Database;
use crate::error::{Error, Result};
use crate::meta::Stat;
use crate::page::PageStore;
use crate::transaction::{self, Transaction, TxnId, TxnState};

/// Name of the data file inside an environment directory.
pub const DATA_FILE: &str = "data.edb";

/// Tunables fixed at environment open time.
#[derive(Debug, Clone, Copy)]
pub struct EnvOptions {
    /// Size of the memory map, which bounds the database size
    pub map_size: usize,
    /// Maximum number of named databases
    pub max_dbs: u32,
    /// Maximum number of concurrent read-only transactions
    pub max_readers: u32,
}

impl Default for EnvOptions {
    fn default() -> Self {
        EnvOptions {
            map_size: DEFAULT_MAP_SIZE,
            max_dbs: DEFAULT_MAX_DBS,
            max_readers: DEFAULT_MAX_READERS,
        }
    }
}

/// Runtime environment information.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvInfo {
    /// Size of the memory map in bytes
    pub map_size: usize,
    /// Number of pages allocated so far
    pub last_pgno: u64,
    /// Generation of the last committed transaction
    pub last_txnid: u64,
    /// Maximum number of concurrent read-only transactions
    pub max_readers: u32,
    /// Read-only transactions currently active
    pub num_readers: u32,
}

/// One entry of the in-memory database table; the index is the dbi. The
/// token distinguishes a slot from an earlier occupant of the same index,
/// since an aborted create frees the index for reuse.
pub(crate) struct DbSlot {
    pub name: Option<String>,
    pub flags: DbFlags,
    pub token: u64,
}

/// Mutable environment state behind the lock.
pub(crate) struct EnvState {
    pub store: PageStore,
    pub dbs: Vec<DbSlot>,
    pub txns: HashMap<TxnId, TxnState>,
    pub next_txn: TxnId,
    /// Next slot token to hand out
    pub db_seq: u64,
    pub readers: u32,
    pub closed: bool,
}

impl EnvState {
    /// Minimum snapshot generation across active transactions.
    pub fn oldest_live_gen(&self) -> Option<u64> {
        self.txns.values().map(|t| t.snapshot_gen).min()
    }
}

pub(crate) struct EnvInner {
    pub path: PathBuf,
    pub flags: EnvFlags,
    pub opts: EnvOptions,
    pub state: Mutex<EnvState>,
}

impl EnvInner {
    pub fn lock(&self) -> MutexGuard<'_, EnvState> {
        // a poisoned lock still guards consistent state; keep going
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Handle to an open environment. Clones share the same underlying state;
/// databases and transactions are resolved through it.
#[derive(Clone)]
pub struct Environment {
    pub(crate) inner: Arc<EnvInner>,
}

impl Environment {
    /// Open or create the environment at `path`. Without `NOSUBDIR` the
    /// path names a directory holding the data file; with it the path is
    /// the data file itself. `mode` is the unix permission for created
    /// files.
    pub fn open(path: &Path, opts: EnvOptions, flags: EnvFlags, mode: u32) -> Result<Environment> {
        let readonly = flags.contains(EnvFlags::RDONLY);
        let data_path = if flags.contains(EnvFlags::NOSUBDIR) {
            path.to_path_buf()
        } else {
            if !readonly {
                std::fs::create_dir_all(path)?;
            }
            path.join(DATA_FILE)
        };

        let store = PageStore::open(
            &data_path,
            opts.map_size,
            readonly,
            flags.contains(EnvFlags::NOSYNC),
            flags.contains(EnvFlags::NOMETASYNC),
            mode,
        )?;
        let dbs: Vec<DbSlot> = store
            .meta
            .dbs
            .iter()
            .enumerate()
            .map(|(i, d)| DbSlot {
                name: d.name.clone(),
                flags: d.flags,
                token: i as u64,
            })
            .collect();
        let db_seq = dbs.len() as u64;
        let next_txn = store.meta.gen + 1;
        log::info!(
            "opened environment at {} (gen {}, {} databases)",
            data_path.display(),
            store.meta.gen,
            store.meta.dbs.len()
        );

        Ok(Environment {
            inner: Arc::new(EnvInner {
                path: data_path,
                flags,
                opts,
                state: Mutex::new(EnvState {
                    store,
                    dbs,
                    txns: HashMap::new(),
                    next_txn,
                    db_seq,
                    readers: 0,
                    closed: false,
                }),
            }),
        })
    }

    /// Start a read-write transaction. Only one write lineage may be
    /// active at a time.
    pub fn begin_rw_txn(&self) -> Result<Transaction> {
        transaction::begin(self, TxnFlags::empty())
    }

    /// Start a read-only transaction pinned to the current snapshot.
    pub fn begin_ro_txn(&self) -> Result<Transaction> {
        transaction::begin(self, TxnFlags::RDONLY)
    }

    pub fn begin_txn(&self, flags: TxnFlags) -> Result<Transaction> {
        transaction::begin(self, flags)
    }

    /// Open a database handle inside `txn`. `name` of `None` is the
    /// always-present default database. Named databases are created with
    /// `DbFlags::CREATE` in a write transaction; the new database becomes
    /// durable when the transaction's root commits.
    pub fn open_database(
        &self,
        txn: &Transaction,
        name: Option<&str>,
        flags: DbFlags,
    ) -> Result<Database> {
        let mut st = self.inner.lock();
        if st.closed {
            return Err(Error::EnvClosed);
        }
        let ts = st.txns.get(&txn.id()).ok_or(Error::TxnFinished)?;

        if let Some(dbi) = st.dbs.iter().position(|d| d.name.as_deref() == name) {
            // a reader's snapshot may predate the slot
            if ts.readonly && dbi >= ts.snapshot_roots.len() {
                return Err(Error::NotFound);
            }
            let slot_flags = st.dbs[dbi].flags;
            if flags.contains(DbFlags::DUPSORT) && !slot_flags.contains(DbFlags::DUPSORT) {
                return Err(Error::Incompatible);
            }
            return Ok(Database::new(
                dbi,
                st.dbs[dbi].name.clone(),
                slot_flags,
                st.dbs[dbi].token,
            ));
        }

        let Some(name) = name else {
            return Err(Error::NotFound);
        };
        if !flags.contains(DbFlags::CREATE) {
            return Err(Error::NotFound);
        }
        if ts.readonly {
            return Err(Error::TxnReadOnly);
        }
        if st.dbs.len() > self.inner.opts.max_dbs as usize {
            return Err(Error::DbsFull);
        }

        let persistent = flags & DbFlags::DUPSORT;
        let dbi = st.dbs.len();
        let token = st.db_seq;
        st.db_seq += 1;
        st.dbs.push(DbSlot {
            name: Some(name.to_string()),
            flags: persistent,
            token,
        });
        if let Some(ts) = st.txns.get_mut(&txn.id()) {
            ts.created_dbs.push(dbi);
        }
        log::debug!("created database {name:?} as dbi {dbi}");
        Ok(Database::new(dbi, Some(name.to_string()), persistent, token))
    }

    /// Flush dirty pages to disk. With `force` the flush happens even in
    /// a `NOSYNC` environment and is pushed through to the device.
    pub fn sync(&self, force: bool) -> Result<()> {
        let st = self.inner.lock();
        if st.closed {
            return Err(Error::EnvClosed);
        }
        st.store.sync(force)
    }

    /// Statistics for the default database.
    pub fn stat(&self) -> Result<Stat> {
        let txn = self.begin_ro_txn()?;
        let db = self.open_database(&txn, None, DbFlags::empty())?;
        db.stat(&txn)
    }

    pub fn info(&self) -> Result<EnvInfo> {
        let st = self.inner.lock();
        if st.closed {
            return Err(Error::EnvClosed);
        }
        Ok(EnvInfo {
            map_size: self.inner.opts.map_size,
            last_pgno: st.store.next_page(),
            last_txnid: st.store.meta.gen,
            max_readers: self.inner.opts.max_readers,
            num_readers: st.readers,
        })
    }

    /// Path of the data file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn flags(&self) -> EnvFlags {
        self.inner.flags
    }

    /// Close the environment. Fails while transactions are still active;
    /// later operations through any handle return `EnvClosed`.
    pub fn close(&self) -> Result<()> {
        let mut st = self.inner.lock();
        if st.closed {
            return Ok(());
        }
        if !st.txns.is_empty() {
            return Err(Error::TxnsStillOpen);
        }
        if !self.inner.flags.contains(EnvFlags::RDONLY) {
            st.store.sync(false)?;
        }
        st.closed = true;
        log::info!("closed environment at {}", self.inner.path.display());
        Ok(())
    }
}
