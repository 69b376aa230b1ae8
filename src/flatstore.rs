use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::constants::{StoreFlags, WriteFlags};
use crate::error::{Error, Result};

const OP_PUT: u8 = 1;
const OP_DEL: u8 = 2;

/// Access profile of a flat store. Both kinds share the same file format;
/// `BTree` guarantees key-ordered iteration, `Hash` promises nothing
/// about order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    BTree,
    Hash,
}

/// Simple single-file key-value store without transactions.
///
/// The file is an append-only record log replayed into memory at open;
/// a torn record at the tail is dropped with a warning, everything before
/// it survives. Writes are synced per record unless `NOSYNC` is set.
pub struct FlatStore {
    path: PathBuf,
    kind: StoreKind,
    file: Option<File>,
    map: BTreeMap<Vec<u8>, Vec<u8>>,
    no_sync: bool,
    closed: bool,
}

fn encode_record(op: u8, key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9 + key.len() + value.len());
    buf.push(op);
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    buf
}

impl FlatStore {
    pub fn open(path: &Path, kind: StoreKind, flags: StoreFlags, mode: u32) -> Result<FlatStore> {
        let readonly = flags.contains(StoreFlags::RDONLY);
        let mut options = OpenOptions::new();
        options.read(true);
        if !readonly {
            options.write(true);
            options.create(flags.contains(StoreFlags::CREATE));
            options.truncate(flags.contains(StoreFlags::TRUNCATE));
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(mode);
            }
        }
        #[cfg(not(unix))]
        let _ = mode;

        let mut file = options.open(path)?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        let (map, valid_len) = replay(&raw);
        if valid_len < raw.len() {
            log::warn!(
                "flat store {} has a torn tail, dropping {} bytes",
                path.display(),
                raw.len() - valid_len
            );
            if !readonly {
                file.set_len(valid_len as u64)?;
            }
        }
        if !readonly {
            file.seek(SeekFrom::End(0))?;
        }
        log::debug!(
            "opened flat store {} ({} entries)",
            path.display(),
            map.len()
        );

        Ok(FlatStore {
            path: path.to_path_buf(),
            kind,
            file: if readonly { None } else { Some(file) },
            map,
            no_sync: flags.contains(StoreFlags::NOSYNC),
            closed: false,
        })
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writable(&mut self) -> Result<&mut File> {
        if self.closed {
            return Err(Error::DbClosed);
        }
        self.file.as_mut().ok_or(Error::EnvReadOnly)
    }

    fn append(&mut self, record: Vec<u8>) -> Result<()> {
        let no_sync = self.no_sync;
        let file = self.writable()?;
        file.write_all(&record)?;
        if !no_sync {
            file.sync_data()?;
        }
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.closed {
            return Err(Error::DbClosed);
        }
        Ok(self.map.get(key).cloned())
    }

    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        if self.closed {
            return Err(Error::DbClosed);
        }
        Ok(self.map.contains_key(key))
    }

    pub fn put(&mut self, key: &[u8], value: &[u8], flags: WriteFlags) -> Result<()> {
        if self.closed {
            return Err(Error::DbClosed);
        }
        if flags.contains(WriteFlags::NOOVERWRITE) && self.map.contains_key(key) {
            return Err(Error::KeyExist);
        }
        self.append(encode_record(OP_PUT, key, value))?;
        self.map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    /// Delete `key`; `NotFound` when it is absent.
    pub fn del(&mut self, key: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::DbClosed);
        }
        if !self.map.contains_key(key) {
            return Err(Error::NotFound);
        }
        self.append(encode_record(OP_DEL, key, &[]))?;
        self.map.remove(key);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// All keys, ordered for a `BTree` store.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.map.keys().cloned().collect()
    }

    /// Rewrite the log with only the live records, dropping superseded
    /// ones accumulated by overwrites and deletes.
    pub fn compact(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::DbClosed);
        }
        if self.file.is_none() {
            return Err(Error::EnvReadOnly);
        }
        let tmp_path = self.path.with_extension("compact");
        {
            let mut tmp = File::create(&tmp_path)?;
            for (key, value) in &self.map {
                tmp.write_all(&encode_record(OP_PUT, key, value))?;
            }
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.seek(SeekFrom::End(0))?;
        self.file = Some(file);
        log::debug!("compacted flat store {}", self.path.display());
        Ok(())
    }

    /// Flush and detach; later operations fail with `DbClosed`.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if let Some(file) = &self.file {
            file.sync_data()?;
        }
        self.closed = true;
        self.file = None;
        Ok(())
    }
}

/// Replay the record log. Returns the rebuilt table and the byte length
/// of the longest valid prefix.
fn replay(raw: &[u8]) -> (BTreeMap<Vec<u8>, Vec<u8>>, usize) {
    let mut map = BTreeMap::new();
    let mut pos = 0;
    loop {
        if pos + 9 > raw.len() {
            break;
        }
        let op = raw[pos];
        let klen = u32::from_le_bytes([raw[pos + 1], raw[pos + 2], raw[pos + 3], raw[pos + 4]]) as usize;
        let vlen = u32::from_le_bytes([raw[pos + 5], raw[pos + 6], raw[pos + 7], raw[pos + 8]]) as usize;
        let end = pos + 9 + klen + vlen;
        if end > raw.len() || (op != OP_PUT && op != OP_DEL) {
            break;
        }
        let key = raw[pos + 9..pos + 9 + klen].to_vec();
        match op {
            OP_PUT => {
                map.insert(key, raw[pos + 9 + klen..end].to_vec());
            }
            _ => {
                map.remove(&key);
            }
        }
        pos = end;
    }
    (map, pos)
}
