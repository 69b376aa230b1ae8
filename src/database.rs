use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::btree;
use crate::constants::DbFlags;
use crate::error::{Error, Result};
use crate::meta::Stat;
use crate::transaction::{self, Transaction, TxnView};

/// Database handle. Cheap to clone; all clones share the closed flag.
/// The handle outlives the transaction it was opened in and stays usable
/// in later transactions until closed.
#[derive(Clone)]
pub struct Database {
    dbi: usize,
    name: Option<String>,
    flags: DbFlags,
    /// Token of the slot this handle was opened on
    token: u64,
    closed: Arc<AtomicBool>,
}

impl Database {
    pub(crate) fn new(dbi: usize, name: Option<String>, flags: DbFlags, token: u64) -> Self {
        Database {
            dbi,
            name,
            flags,
            token,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn dbi(&self) -> usize {
        self.dbi
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn flags(&self) -> DbFlags {
        self.flags
    }

    pub fn is_dupsort(&self) -> bool {
        self.flags.contains(DbFlags::DUPSORT)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::DbClosed);
        }
        Ok(())
    }

    /// Close this handle. Data stays on disk; only the handle and its
    /// clones become unusable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Tree statistics as seen by `txn`. Duplicates each count as one
    /// entry.
    pub fn stat(&self, txn: &Transaction) -> Result<Stat> {
        self.ensure_open()?;
        let dupsort = self.is_dupsort();
        let mut st = txn.env().inner.lock();
        transaction::check_slot(&st, self)?;
        let root = transaction::root_for(&st, txn.id(), self.dbi)?;
        let mut view = TxnView {
            state: &mut st,
            txn: txn.id(),
        };
        btree::tree_stat(&mut view, root, |_, v| {
            if dupsort {
                dup_count(v)
            } else {
                1
            }
        })
    }
}

// A DUPSORT key stores its duplicates as one sorted list in the single
// value slot: u32 count, then (u32 len, bytes) per value.

pub(crate) fn encode_dups(values: &[Vec<u8>]) -> Vec<u8> {
    let total: usize = values.iter().map(|v| 4 + v.len()).sum();
    let mut buf = Vec::with_capacity(4 + total);
    buf.extend_from_slice(&(values.len() as u32).to_le_bytes());
    for v in values {
        buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
        buf.extend_from_slice(v);
    }
    buf
}

pub(crate) fn decode_dups(raw: &[u8]) -> Result<Vec<Vec<u8>>> {
    let take = |pos: &mut usize, n: usize| -> Result<&[u8]> {
        if *pos + n > raw.len() {
            return Err(Error::Corrupted);
        }
        let s = &raw[*pos..*pos + n];
        *pos += n;
        Ok(s)
    };
    let mut pos = 0;
    let count_raw = take(&mut pos, 4)?.try_into().map_err(|_| Error::Corrupted)?;
    let count = u32::from_le_bytes(count_raw) as usize;
    let mut values = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let len_raw = take(&mut pos, 4)?.try_into().map_err(|_| Error::Corrupted)?;
        let len = u32::from_le_bytes(len_raw) as usize;
        values.push(take(&mut pos, len)?.to_vec());
    }
    Ok(values)
}

/// Lowest duplicate in the list.
pub(crate) fn first_dup(raw: &[u8]) -> Result<Vec<u8>> {
    decode_dups(raw)?.into_iter().next().ok_or(Error::Corrupted)
}

/// Number of duplicates, or one when the list cannot be decoded so that
/// statistics stay usable on damaged data.
pub(crate) fn dup_count(raw: &[u8]) -> usize {
    decode_dups(raw).map_or(1, |v| v.len())
}

/// Insert `value` into the sorted list. `Ok(None)` means the value was
/// already present and duplicates are allowed, so the caller has nothing
/// to write.
pub(crate) fn dup_insert(raw: &[u8], value: &[u8], no_dup: bool) -> Result<Option<Vec<u8>>> {
    let mut values = decode_dups(raw)?;
    match values.binary_search_by(|v| v.as_slice().cmp(value)) {
        Ok(_) if no_dup => Err(Error::KeyExist),
        Ok(_) => Ok(None),
        Err(i) => {
            values.insert(i, value.to_vec());
            Ok(Some(encode_dups(&values)))
        }
    }
}

/// Remove `value` from the sorted list. `Ok(None)` means the list became
/// empty and the key itself should be deleted.
pub(crate) fn dup_remove(raw: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut values = decode_dups(raw)?;
    let i = values
        .binary_search_by(|v| v.as_slice().cmp(value))
        .map_err(|_| Error::NotFound)?;
    values.remove(i);
    if values.is_empty() {
        Ok(None)
    } else {
        Ok(Some(encode_dups(&values)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dup_list_round_trip() {
        let values = vec![b"a".to_vec(), b"bb".to_vec(), b"ccc".to_vec()];
        let raw = encode_dups(&values);
        assert_eq!(decode_dups(&raw).unwrap(), values);
        assert_eq!(first_dup(&raw).unwrap(), b"a".to_vec());
        assert_eq!(dup_count(&raw), 3);
    }

    #[test]
    fn dup_insert_keeps_order() {
        let raw = encode_dups(&[b"b".to_vec(), b"d".to_vec()]);
        let raw = dup_insert(&raw, b"c", false).unwrap().unwrap();
        assert_eq!(
            decode_dups(&raw).unwrap(),
            vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );

        // exact duplicate is a no-op unless NODUPDATA
        assert!(dup_insert(&raw, b"c", false).unwrap().is_none());
        assert!(matches!(dup_insert(&raw, b"c", true), Err(Error::KeyExist)));
    }

    #[test]
    fn dup_remove_drains_to_none() {
        let raw = encode_dups(&[b"x".to_vec(), b"y".to_vec()]);
        let raw = dup_remove(&raw, b"x").unwrap().unwrap();
        assert_eq!(decode_dups(&raw).unwrap(), vec![b"y".to_vec()]);
        assert!(dup_remove(&raw, b"y").unwrap().is_none());
        assert!(matches!(dup_remove(&raw, b"zzz"), Err(Error::NotFound)));
    }

    #[test]
    fn dup_list_rejects_garbage() {
        assert!(decode_dups(&[0xff, 0xff, 0xff, 0xff, 1]).is_err());
        assert!(decode_dups(&[]).is_err());
    }
}
