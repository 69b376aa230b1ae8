use std::collections::VecDeque;

use crate::btree::NodeStore;
use crate::database;
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::page::{Node, PageId};
use crate::transaction::{TxnId, TxnView};

/// Forward iterator over one database, in key order.
///
/// The cursor is frozen at the tree root captured when it was opened;
/// writes made later in the same transaction are not seen. On a DUPSORT
/// database each duplicate comes out as its own (key, value) pair.
pub struct Cursor {
    env: Environment,
    txn: TxnId,
    root: Option<PageId>,
    dupsort: bool,
    /// Traversal stack of (page, next entry index)
    stack: Vec<(PageId, usize)>,
    /// Pairs decoded from the current leaf entry but not yet returned
    ready: VecDeque<(Vec<u8>, Vec<u8>)>,
}

impl Cursor {
    pub(crate) fn new(env: Environment, txn: TxnId, root: Option<PageId>, dupsort: bool) -> Self {
        let stack = root.map(|pid| vec![(pid, 0)]).unwrap_or_default();
        Cursor {
            env,
            txn,
            root,
            dupsort,
            stack,
            ready: VecDeque::new(),
        }
    }

    /// Next pair, or `None` once the database is exhausted. Fails with
    /// `TxnFinished` after the owning transaction ends.
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut st = self.env.inner.lock();
        // liveness first, so buffered duplicates die with the transaction
        if !st.txns.contains_key(&self.txn) {
            return Err(Error::TxnFinished);
        }
        if let Some(pair) = self.ready.pop_front() {
            return Ok(Some(pair));
        }
        let mut view = TxnView {
            state: &mut st,
            txn: self.txn,
        };

        while let Some((pid, idx)) = self.stack.last().copied() {
            let node = view.load(pid)?;
            match &*node {
                Node::Leaf(entries) => {
                    if idx >= entries.len() {
                        self.stack.pop();
                        continue;
                    }
                    if let Some(top) = self.stack.last_mut() {
                        top.1 = idx + 1;
                    }
                    let (key, raw) = &entries[idx];
                    if self.dupsort {
                        for value in database::decode_dups(raw)? {
                            self.ready.push_back((key.clone(), value));
                        }
                        if let Some(pair) = self.ready.pop_front() {
                            return Ok(Some(pair));
                        }
                        // empty duplicate lists are never stored
                        continue;
                    }
                    return Ok(Some((key.clone(), raw.clone())));
                }
                Node::Branch(entries) => {
                    if idx >= entries.len() {
                        self.stack.pop();
                        continue;
                    }
                    if let Some(top) = self.stack.last_mut() {
                        top.1 = idx + 1;
                    }
                    self.stack.push((entries[idx].1, 0));
                }
            }
        }
        Ok(None)
    }

    /// Reset to the first pair of the captured tree.
    pub fn rewind(&mut self) {
        self.ready.clear();
        self.stack = self.root.map(|pid| vec![(pid, 0)]).unwrap_or_default();
    }
}
