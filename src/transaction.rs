use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::btree::{self, NodeStore};
use crate::constants::{EnvFlags, TxnFlags, WriteFlags, MAX_KEY_SIZE};
use crate::cursor::Cursor;
use crate::database::{self, Database};
use crate::env::{EnvState, Environment};
use crate::error::{Error, Result};
use crate::meta::DbRecord;
use crate::page::{Node, PageId};

/// Transaction identifier. Write transaction ids double as commit
/// generations, so they are monotonic across the environment's life.
pub(crate) type TxnId = u64;

/// Per-transaction bookkeeping held in the environment's transaction table.
/// A transaction missing from the table has terminated.
pub(crate) struct TxnState {
    pub readonly: bool,
    pub parent: Option<TxnId>,
    /// Generation this transaction's snapshot was taken from
    pub snapshot_gen: u64,
    /// Per-dbi roots visible at begin time
    pub snapshot_roots: Vec<Option<PageId>>,
    /// Uncommitted page overlay
    pub dirty: HashMap<PageId, Arc<Node>>,
    /// Roots moved by this transaction, keyed by dbi
    pub dirty_roots: HashMap<usize, Option<PageId>>,
    /// Pages this transaction allocated
    pub allocated: Vec<PageId>,
    /// Pages this transaction superseded or deleted
    pub freed: Vec<PageId>,
    /// Dbi slots this transaction created
    pub created_dbs: Vec<usize>,
}

/// Root visible to `txn` for `dbi`: its own moved root if it has one,
/// otherwise the snapshot root from begin time.
pub(crate) fn root_for(st: &EnvState, txn: TxnId, dbi: usize) -> Result<Option<PageId>> {
    let ts = st.txns.get(&txn).ok_or(Error::TxnFinished)?;
    Ok(match ts.dirty_roots.get(&dbi) {
        Some(root) => *root,
        None => ts.snapshot_roots.get(dbi).copied().flatten(),
    })
}

fn has_child(st: &EnvState, txn: TxnId) -> bool {
    st.txns.values().any(|t| t.parent == Some(txn))
}

/// A handle is only valid while its slot still belongs to the database it
/// was opened on; an aborted create hands the slot index to the next
/// created database.
pub(crate) fn check_slot(st: &EnvState, db: &Database) -> Result<()> {
    match st.dbs.get(db.dbi()) {
        Some(slot) if slot.token == db.token() => Ok(()),
        _ => Err(Error::DbClosed),
    }
}

/// Lengths of a transaction's page accounting, taken before a tree
/// operation so a failed one can be undone.
struct OpMark {
    allocated: usize,
    freed: usize,
}

fn op_mark(st: &EnvState, txn: TxnId) -> Result<OpMark> {
    let ts = st.txns.get(&txn).ok_or(Error::TxnFinished)?;
    Ok(OpMark {
        allocated: ts.allocated.len(),
        freed: ts.freed.len(),
    })
}

/// Undo the page effects of a failed tree operation: forget the retire
/// entries it pushed, drop the overlay nodes it created, and return its
/// allocations to the arena. Roots only move on success, so afterwards the
/// transaction is back at its pre-operation state.
fn op_rollback(st: &mut EnvState, txn: TxnId, mark: OpMark) {
    let Some(ts) = st.txns.get_mut(&txn) else {
        return;
    };
    ts.freed.truncate(mark.freed);
    let undone = ts.allocated.split_off(mark.allocated);
    for pid in &undone {
        ts.dirty.remove(pid);
    }
    for pid in undone {
        st.store.free(pid);
    }
}

/// Writes require an active read-write transaction with no live child;
/// while a child exists the parent's pages belong to the child's view.
fn require_write(st: &EnvState, txn: TxnId) -> Result<()> {
    let ts = st.txns.get(&txn).ok_or(Error::TxnFinished)?;
    if ts.readonly {
        return Err(Error::TxnReadOnly);
    }
    if has_child(st, txn) {
        return Err(Error::WriterConflict);
    }
    Ok(())
}

/// Page access for one transaction: reads walk the overlay chain up the
/// nesting lineage before the committed store; writes always move a page
/// to a fresh id so every committed or ancestor page stays intact until
/// the root commit publishes.
pub(crate) struct TxnView<'a> {
    pub state: &'a mut EnvState,
    pub txn: TxnId,
}

impl NodeStore for TxnView<'_> {
    fn load(&mut self, id: PageId) -> Result<Arc<Node>> {
        let mut cur = Some(self.txn);
        while let Some(txn) = cur {
            let Some(ts) = self.state.txns.get(&txn) else {
                break;
            };
            if let Some(node) = ts.dirty.get(&id) {
                return Ok(node.clone());
            }
            cur = ts.parent;
        }
        self.state.store.read(id)
    }

    fn update(&mut self, id: PageId, node: Node) -> Result<PageId> {
        let new_id = self.alloc(node)?;
        self.retire(id)?;
        Ok(new_id)
    }

    fn alloc(&mut self, node: Node) -> Result<PageId> {
        let id = self.state.store.allocate()?;
        let ts = self.state.txns.get_mut(&self.txn).ok_or(Error::TxnFinished)?;
        ts.dirty.insert(id, Arc::new(node));
        ts.allocated.push(id);
        Ok(id)
    }

    fn retire(&mut self, id: PageId) -> Result<()> {
        let ts = self.state.txns.get_mut(&self.txn).ok_or(Error::TxnFinished)?;
        ts.freed.push(id);
        Ok(())
    }
}

/// Start a top-level transaction on `env`.
pub(crate) fn begin(env: &Environment, flags: TxnFlags) -> Result<Transaction> {
    let readonly = flags.contains(TxnFlags::RDONLY);
    let mut st = env.inner.lock();
    if st.closed {
        return Err(Error::EnvClosed);
    }
    if readonly {
        if st.readers >= env.inner.opts.max_readers {
            return Err(Error::ReadersFull);
        }
    } else {
        if env.inner.flags.contains(EnvFlags::RDONLY) {
            return Err(Error::EnvReadOnly);
        }
        if st.txns.values().any(|t| !t.readonly) {
            return Err(Error::WriterConflict);
        }
    }

    let id = st.next_txn;
    st.next_txn += 1;
    let snapshot_gen = st.store.meta.gen;
    let snapshot_roots = st.store.meta.dbs.iter().map(|d| d.root).collect();
    st.txns.insert(
        id,
        TxnState {
            readonly,
            parent: None,
            snapshot_gen,
            snapshot_roots,
            dirty: HashMap::new(),
            dirty_roots: HashMap::new(),
            allocated: Vec::new(),
            freed: Vec::new(),
            created_dbs: Vec::new(),
        },
    );
    if readonly {
        st.readers += 1;
    }
    log::trace!("begin txn {id} (readonly: {readonly}, snapshot gen {snapshot_gen})");
    Ok(Transaction {
        env: env.clone(),
        id,
        readonly,
        finished: false,
    })
}

/// Abort a transaction and, first, every live descendant. Pages the
/// lineage allocated go straight back to the free list; nothing it did is
/// visible afterwards.
pub(crate) fn abort_inner(st: &mut EnvState, id: TxnId) {
    let children: Vec<TxnId> = st
        .txns
        .iter()
        .filter(|(_, t)| t.parent == Some(id))
        .map(|(i, _)| *i)
        .collect();
    for child in children {
        abort_inner(st, child);
    }
    let Some(ts) = st.txns.remove(&id) else {
        return;
    };
    if ts.readonly {
        st.readers -= 1;
    }
    for pid in ts.allocated {
        st.store.free(pid);
    }
    // created slots sit at the tail of the table while their txn lives
    let mut created = ts.created_dbs;
    created.sort_unstable();
    for dbi in created.into_iter().rev() {
        if dbi + 1 == st.dbs.len() {
            st.dbs.pop();
        }
    }
    let oldest = st.oldest_live_gen();
    st.store.reclaim(oldest);
    log::trace!("aborted txn {id}");
}

fn commit_inner(st: &mut EnvState, id: TxnId) -> Result<()> {
    let ts = st.txns.get(&id).ok_or(Error::TxnFinished)?;
    if has_child(st, id) {
        return Err(Error::TxnHasChild);
    }
    if ts.readonly {
        st.txns.remove(&id);
        st.readers -= 1;
        let oldest = st.oldest_live_gen();
        st.store.reclaim(oldest);
        return Ok(());
    }

    let Some(ts) = st.txns.remove(&id) else {
        return Err(Error::TxnFinished);
    };

    if let Some(parent_id) = ts.parent {
        let parent = st.txns.get_mut(&parent_id).ok_or(Error::ParentNotActive)?;
        parent.dirty.extend(ts.dirty);
        parent.allocated.extend(ts.allocated);
        parent.freed.extend(ts.freed);
        parent.dirty_roots.extend(ts.dirty_roots);
        parent.created_dbs.extend(ts.created_dbs);
        log::trace!("merged txn {id} into parent {parent_id}");
        return Ok(());
    }

    if ts.dirty.is_empty() && ts.dirty_roots.is_empty() && ts.created_dbs.is_empty() && ts.freed.is_empty() {
        let oldest = st.oldest_live_gen();
        st.store.reclaim(oldest);
        return Ok(());
    }

    // pages both allocated and freed by the lineage were never durable
    let allocated: HashSet<PageId> = ts.allocated.iter().copied().collect();
    let mut dirty = ts.dirty;
    let mut durable_freed = Vec::new();
    for pid in ts.freed {
        if allocated.contains(&pid) {
            dirty.remove(&pid);
            st.store.free(pid);
        } else {
            durable_freed.push(pid);
        }
    }

    for (pid, node) in dirty {
        st.store.write_node(pid, node)?;
    }

    let records: Vec<DbRecord> = st
        .dbs
        .iter()
        .enumerate()
        .map(|(dbi, slot)| DbRecord {
            name: slot.name.clone(),
            flags: slot.flags,
            root: match ts.dirty_roots.get(&dbi) {
                Some(root) => *root,
                None => st.store.meta.dbs.get(dbi).and_then(|d| d.root),
            },
        })
        .collect();

    st.store.meta.gen = id;
    st.store.meta.dbs = records;
    st.store.meta.next_page = st.store.next_page();
    st.store.defer_free(id, durable_freed);
    st.store.meta.free = st.store.persistable_free();
    st.store.publish()?;

    let oldest = st.oldest_live_gen();
    st.store.reclaim(oldest);
    log::debug!("committed generation {id}");
    Ok(())
}

/// Tree side of `put`. `Ok(None)` means an allowed exact duplicate was
/// already stored and no page moved.
fn put_in_tree(
    view: &mut TxnView<'_>,
    root: Option<PageId>,
    key: &[u8],
    value: &[u8],
    flags: WriteFlags,
    dupsort: bool,
) -> Result<Option<PageId>> {
    if dupsort {
        let existing = btree::lookup(view, root, key)?;
        if existing.is_some() && flags.contains(WriteFlags::NOOVERWRITE) {
            return Err(Error::KeyExist);
        }
        let list = match existing {
            Some(raw) => {
                match database::dup_insert(&raw, value, flags.contains(WriteFlags::NODUPDATA))? {
                    Some(list) => list,
                    None => return Ok(None),
                }
            }
            None => database::encode_dups(&[value.to_vec()]),
        };
        Ok(Some(btree::insert(view, root, key, &list)?))
    } else {
        if flags.contains(WriteFlags::NOOVERWRITE) && btree::lookup(view, root, key)?.is_some() {
            return Err(Error::KeyExist);
        }
        Ok(Some(btree::insert(view, root, key, value)?))
    }
}

/// Tree side of `del`, returning the root after the removal.
fn del_in_tree(
    view: &mut TxnView<'_>,
    root: Option<PageId>,
    key: &[u8],
    value: Option<&[u8]>,
    dupsort: bool,
) -> Result<Option<PageId>> {
    match (dupsort, value) {
        (true, Some(value)) => {
            let raw = btree::lookup(view, root, key)?.ok_or(Error::NotFound)?;
            match database::dup_remove(&raw, value)? {
                Some(list) => Ok(Some(btree::insert(view, root, key, &list)?)),
                None => Ok(btree::delete(view, root, key)?.0),
            }
        }
        (false, Some(value)) => {
            let current = btree::lookup(view, root, key)?.ok_or(Error::NotFound)?;
            if current != value {
                return Err(Error::NotFound);
            }
            Ok(btree::delete(view, root, key)?.0)
        }
        (_, None) => Ok(btree::delete(view, root, key)?.0),
    }
}

/// A transaction handle. Read-only transactions see a frozen snapshot of
/// the environment; read-write transactions stage changes in memory until
/// their root commits. Dropping an unfinished transaction aborts it.
pub struct Transaction {
    env: Environment,
    id: TxnId,
    readonly: bool,
    finished: bool,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Start a nested write transaction. The child sees the parent's
    /// uncommitted state; the parent must not touch the databases until
    /// the child finishes. Read-only transactions cannot nest.
    pub fn begin_child(&self) -> Result<Transaction> {
        let mut st = self.env.inner.lock();
        let parent = st.txns.get(&self.id).ok_or(Error::TxnFinished)?;
        if parent.readonly {
            return Err(Error::Incompatible);
        }
        if has_child(&st, self.id) {
            return Err(Error::WriterConflict);
        }
        let snapshot_gen = parent.snapshot_gen;
        let snapshot_roots: Vec<Option<PageId>> = (0..st.dbs.len())
            .map(|dbi| match parent.dirty_roots.get(&dbi) {
                Some(root) => *root,
                None => parent.snapshot_roots.get(dbi).copied().flatten(),
            })
            .collect();

        let id = st.next_txn;
        st.next_txn += 1;
        st.txns.insert(
            id,
            TxnState {
                readonly: false,
                parent: Some(self.id),
                snapshot_gen,
                snapshot_roots,
                dirty: HashMap::new(),
                dirty_roots: HashMap::new(),
                allocated: Vec::new(),
                freed: Vec::new(),
                created_dbs: Vec::new(),
            },
        );
        log::trace!("begin nested txn {id} under {}", self.id);
        Ok(Transaction {
            env: self.env.clone(),
            id,
            readonly: false,
            finished: false,
        })
    }

    /// Commit the transaction. A nested commit folds its changes into the
    /// parent; a root commit publishes them durably. On failure the
    /// transaction is aborted.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        let env = self.env.clone();
        let mut st = env.inner.lock();
        let out = commit_inner(&mut st, self.id);
        if out.is_err() {
            abort_inner(&mut st, self.id);
        }
        out
    }

    /// Abort the transaction and every live descendant.
    pub fn abort(mut self) {
        self.finished = true;
        let mut st = self.env.inner.lock();
        abort_inner(&mut st, self.id);
    }

    /// Look up `key`. For a DUPSORT database the first (lowest) duplicate
    /// is returned.
    pub fn get(&self, db: &Database, key: &[u8]) -> Result<Option<Vec<u8>>> {
        db.ensure_open()?;
        let mut st = self.env.inner.lock();
        check_slot(&st, db)?;
        let root = root_for(&st, self.id, db.dbi())?;
        let mut view = TxnView {
            state: &mut st,
            txn: self.id,
        };
        match btree::lookup(&mut view, root, key)? {
            None => Ok(None),
            Some(raw) if db.is_dupsort() => Ok(Some(database::first_dup(&raw)?)),
            Some(raw) => Ok(Some(raw)),
        }
    }

    pub fn exists(&self, db: &Database, key: &[u8]) -> Result<bool> {
        db.ensure_open()?;
        let mut st = self.env.inner.lock();
        check_slot(&st, db)?;
        let root = root_for(&st, self.id, db.dbi())?;
        let mut view = TxnView {
            state: &mut st,
            txn: self.id,
        };
        Ok(btree::lookup(&mut view, root, key)?.is_some())
    }

    /// All duplicates stored under `key`, in sorted order. On a plain
    /// database this is the single value, when present.
    pub fn get_all(&self, db: &Database, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        db.ensure_open()?;
        let mut st = self.env.inner.lock();
        check_slot(&st, db)?;
        let root = root_for(&st, self.id, db.dbi())?;
        let mut view = TxnView {
            state: &mut st,
            txn: self.id,
        };
        match btree::lookup(&mut view, root, key)? {
            None => Ok(Vec::new()),
            Some(raw) if db.is_dupsort() => database::decode_dups(&raw),
            Some(raw) => Ok(vec![raw]),
        }
    }

    /// Store a pair. `NOOVERWRITE` refuses to touch an existing key; on a
    /// DUPSORT database the value joins the key's sorted duplicate set,
    /// and `NODUPDATA` refuses an exact duplicate. A failed put leaves the
    /// transaction unchanged.
    pub fn put(&self, db: &Database, key: &[u8], value: &[u8], flags: WriteFlags) -> Result<()> {
        db.ensure_open()?;
        if key.is_empty() || key.len() > MAX_KEY_SIZE {
            return Err(Error::BadValSize);
        }
        let mut st = self.env.inner.lock();
        check_slot(&st, db)?;
        require_write(&st, self.id)?;
        let mark = op_mark(&st, self.id)?;
        let root = root_for(&st, self.id, db.dbi())?;
        let mut view = TxnView {
            state: &mut st,
            txn: self.id,
        };

        let new_root = match put_in_tree(&mut view, root, key, value, flags, db.is_dupsort()) {
            Ok(Some(new_root)) => new_root,
            // value already present, nothing to do
            Ok(None) => return Ok(()),
            Err(err) => {
                op_rollback(&mut st, self.id, mark);
                return Err(err);
            }
        };

        if let Some(ts) = st.txns.get_mut(&self.id) {
            ts.dirty_roots.insert(db.dbi(), Some(new_root));
        }
        Ok(())
    }

    /// Delete `key`, or one duplicate of it. With `value` given, a plain
    /// database deletes only when the stored value matches, and a DUPSORT
    /// database removes just that duplicate. A failed delete leaves the
    /// transaction unchanged.
    pub fn del(&self, db: &Database, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        db.ensure_open()?;
        let mut st = self.env.inner.lock();
        check_slot(&st, db)?;
        require_write(&st, self.id)?;
        let mark = op_mark(&st, self.id)?;
        let root = root_for(&st, self.id, db.dbi())?;
        let mut view = TxnView {
            state: &mut st,
            txn: self.id,
        };

        let new_root = match del_in_tree(&mut view, root, key, value, db.is_dupsort()) {
            Ok(new_root) => new_root,
            Err(err) => {
                op_rollback(&mut st, self.id, mark);
                return Err(err);
            }
        };

        if let Some(ts) = st.txns.get_mut(&self.id) {
            ts.dirty_roots.insert(db.dbi(), new_root);
        }
        Ok(())
    }

    /// Open a cursor over `db`, frozen at the tree this transaction sees
    /// right now. Writes made afterwards in the same transaction do not
    /// move the cursor's view.
    pub fn cursor(&self, db: &Database) -> Result<Cursor> {
        db.ensure_open()?;
        let st = self.env.inner.lock();
        check_slot(&st, db)?;
        let root = root_for(&st, self.id, db.dbi())?;
        drop(st);
        Ok(Cursor::new(self.env.clone(), self.id, root, db.is_dupsort()))
    }

    pub(crate) fn env(&self) -> &Environment {
        &self.env
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            let mut st = self.env.inner.lock();
            abort_inner(&mut st, self.id);
        }
    }
}
