use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions};

use crate::constants::{META_PAGES, PAGE_CAPACITY, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::meta::{decode_meta, encode_meta, MetaHeader};

/// Opaque page identifier. Pages 0 and 1 are the meta slots.
pub(crate) type PageId = u64;

const NODE_LEAF: u8 = 1;
const NODE_BRANCH: u8 = 2;

/// Logical content of one data page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Node {
    /// Ordered (key, value) pairs
    Leaf(Vec<(Vec<u8>, Vec<u8>)>),
    /// Ordered (separator, child) pairs; separators are lower bounds
    Branch(Vec<(Vec<u8>, PageId)>),
}

impl Node {
    pub fn encoded_len(&self) -> usize {
        match self {
            Node::Leaf(entries) => {
                4 + entries.iter().map(|(k, v)| 6 + k.len() + v.len()).sum::<usize>()
            }
            Node::Branch(entries) => {
                4 + entries.iter().map(|(k, _)| 10 + k.len()).sum::<usize>()
            }
        }
    }

    /// Encoded size of one leaf entry.
    pub fn entry_len(key: &[u8], value: &[u8]) -> usize {
        6 + key.len() + value.len()
    }
}

pub(crate) fn encode_node(node: &Node) -> Result<Vec<u8>> {
    let len = node.encoded_len();
    if len > PAGE_CAPACITY {
        return Err(Error::BadValSize);
    }
    let mut buf = Vec::with_capacity(len);
    match node {
        Node::Leaf(entries) => {
            buf.push(NODE_LEAF);
            buf.push(0);
            buf.extend_from_slice(&(entries.len() as u16).to_le_bytes());
            for (k, v) in entries {
                buf.extend_from_slice(&(k.len() as u16).to_le_bytes());
                buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
                buf.extend_from_slice(k);
                buf.extend_from_slice(v);
            }
        }
        Node::Branch(entries) => {
            buf.push(NODE_BRANCH);
            buf.push(0);
            buf.extend_from_slice(&(entries.len() as u16).to_le_bytes());
            for (k, child) in entries {
                buf.extend_from_slice(&(k.len() as u16).to_le_bytes());
                buf.extend_from_slice(k);
                buf.extend_from_slice(&child.to_le_bytes());
            }
        }
    }
    Ok(buf)
}

pub(crate) fn decode_node(buf: &[u8]) -> Result<Node> {
    if buf.len() < 4 {
        return Err(Error::Corrupted);
    }
    let tag = buf[0];
    let count = u16::from_le_bytes([buf[2], buf[3]]) as usize;
    // empty nodes are never written; an empty tree has no root at all
    if count == 0 {
        return Err(Error::Corrupted);
    }
    let mut pos = 4;

    let take = |pos: &mut usize, n: usize| -> Result<&[u8]> {
        if *pos + n > buf.len() {
            return Err(Error::Corrupted);
        }
        let s = &buf[*pos..*pos + n];
        *pos += n;
        Ok(s)
    };

    match tag {
        NODE_LEAF => {
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let klen_raw = take(&mut pos, 2)?;
                let klen = u16::from_le_bytes([klen_raw[0], klen_raw[1]]) as usize;
                let vlen_raw = take(&mut pos, 4)?;
                let vlen =
                    u32::from_le_bytes([vlen_raw[0], vlen_raw[1], vlen_raw[2], vlen_raw[3]])
                        as usize;
                let key = take(&mut pos, klen)?.to_vec();
                let value = take(&mut pos, vlen)?.to_vec();
                entries.push((key, value));
            }
            Ok(Node::Leaf(entries))
        }
        NODE_BRANCH => {
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let klen_raw = take(&mut pos, 2)?;
                let klen = u16::from_le_bytes([klen_raw[0], klen_raw[1]]) as usize;
                let key = take(&mut pos, klen)?.to_vec();
                let child_raw = take(&mut pos, 8)?;
                let mut child = [0u8; 8];
                child.copy_from_slice(child_raw);
                entries.push((key, u64::from_le_bytes(child)));
            }
            Ok(Node::Branch(entries))
        }
        _ => Err(Error::Corrupted),
    }
}

/// Fixed-size page arena over a memory-mapped file.
///
/// Committed pages are immutable; writers allocate fresh pages and the
/// durable root moves only when a root transaction publishes. Superseded
/// pages sit in a pending list until no live snapshot can still reach them.
pub(crate) struct PageStore {
    map: MmapMut,
    file: File,
    readonly: bool,
    no_sync: bool,
    no_meta_sync: bool,
    max_pages: u64,
    meta_slot: u64,
    /// Latest committed meta
    pub meta: MetaHeader,
    next_page: PageId,
    free: Vec<PageId>,
    pending: Vec<(u64, Vec<PageId>)>,
    cache: HashMap<PageId, Arc<Node>>,
}

impl PageStore {
    pub fn open(
        path: &Path,
        map_size: usize,
        readonly: bool,
        no_sync: bool,
        no_meta_sync: bool,
        mode: u32,
    ) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true);
        if !readonly {
            options.write(true).create(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(mode);
            }
        }
        #[cfg(not(unix))]
        let _ = mode;

        let file = options.open(path)?;
        let file_len = file.metadata()?.len();
        let fresh = file_len == 0;

        let want = (map_size + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE;
        let target_len = (file_len as usize).max(want).max(PAGE_SIZE * META_PAGES as usize);
        if !readonly && (file_len as usize) < target_len {
            file.set_len(target_len as u64)?;
        }

        // A read-only environment never writes back, so a private mapping
        // keeps the one MmapMut type without needing write permission.
        let map = unsafe {
            if readonly {
                MmapOptions::new().len(target_len).map_copy(&file)?
            } else {
                MmapOptions::new().len(target_len).map_mut(&file)?
            }
        };

        let mut store = PageStore {
            map,
            file,
            readonly,
            no_sync,
            no_meta_sync,
            max_pages: (target_len / PAGE_SIZE) as u64,
            meta_slot: 0,
            meta: MetaHeader::initial(),
            next_page: META_PAGES,
            free: Vec::new(),
            pending: Vec::new(),
            cache: HashMap::new(),
        };

        if fresh {
            if readonly {
                return Err(Error::Corrupted);
            }
            store.write_meta_slot(0)?;
            store.flush_meta(0)?;
            log::debug!("initialized fresh store at {}", path.display());
        } else {
            store.load_meta()?;
            log::debug!(
                "recovered store at {} (gen {}, slot {})",
                path.display(),
                store.meta.gen,
                store.meta_slot
            );
        }

        Ok(store)
    }

    fn load_meta(&mut self) -> Result<()> {
        let mut best: Option<(u64, MetaHeader)> = None;
        let mut version_err = false;
        for slot in 0..META_PAGES {
            let off = (slot * PAGE_SIZE as u64) as usize;
            match decode_meta(&self.map[off..off + PAGE_SIZE]) {
                Ok(meta) => {
                    if best.as_ref().map_or(true, |(_, b)| meta.gen > b.gen) {
                        best = Some((slot, meta));
                    }
                }
                Err(Error::VersionMismatch) => version_err = true,
                Err(_) => {}
            }
        }
        match best {
            Some((slot, meta)) => {
                self.meta_slot = slot;
                self.next_page = meta.next_page;
                self.free = meta.free.clone();
                self.meta = meta;
                Ok(())
            }
            None if version_err => Err(Error::VersionMismatch),
            None => Err(Error::Corrupted),
        }
    }

    fn write_meta_slot(&mut self, slot: u64) -> Result<()> {
        let buf = encode_meta(&self.meta);
        let off = (slot * PAGE_SIZE as u64) as usize;
        self.map[off..off + PAGE_SIZE].copy_from_slice(&buf);
        Ok(())
    }

    fn flush_meta(&self, slot: u64) -> Result<()> {
        if self.no_sync || self.no_meta_sync {
            return Ok(());
        }
        let off = (slot * PAGE_SIZE as u64) as usize;
        self.map.flush_range(off, PAGE_SIZE)?;
        Ok(())
    }

    pub fn allocate(&mut self) -> Result<PageId> {
        if let Some(pid) = self.free.pop() {
            return Ok(pid);
        }
        if self.next_page >= self.max_pages {
            return Err(Error::MapFull);
        }
        let pid = self.next_page;
        self.next_page += 1;
        Ok(pid)
    }

    /// Return a never-published page to the free list.
    pub fn free(&mut self, pid: PageId) {
        self.cache.remove(&pid);
        self.free.push(pid);
    }

    /// Queue committed pages superseded by the commit at `gen`; they become
    /// reusable once every snapshot that could reach them has ended.
    pub fn defer_free(&mut self, gen: u64, pages: Vec<PageId>) {
        if !pages.is_empty() {
            self.pending.push((gen, pages));
        }
    }

    /// Reclaim pending pages not reachable from any live snapshot.
    /// `oldest_live` is the minimum snapshot generation among active
    /// transactions, or `None` when there are none.
    pub fn reclaim(&mut self, oldest_live: Option<u64>) {
        let mut kept = Vec::new();
        for (gen, pages) in self.pending.drain(..) {
            if oldest_live.map_or(true, |o| o >= gen) {
                for pid in pages {
                    self.cache.remove(&pid);
                    self.free.push(pid);
                }
            } else {
                kept.push((gen, pages));
            }
        }
        self.pending = kept;
    }

    /// Read a committed page, decoding it from the map on first access.
    pub fn read(&mut self, pid: PageId) -> Result<Arc<Node>> {
        if let Some(node) = self.cache.get(&pid) {
            return Ok(node.clone());
        }
        if pid < META_PAGES || pid >= self.next_page {
            return Err(Error::PageNotFound);
        }
        let off = (pid * PAGE_SIZE as u64) as usize;
        let node = Arc::new(decode_node(&self.map[off..off + PAGE_SIZE])?);
        self.cache.insert(pid, node.clone());
        Ok(node)
    }

    /// Encode a node into its page slot and install it as committed.
    pub fn write_node(&mut self, pid: PageId, node: Arc<Node>) -> Result<()> {
        if self.readonly {
            return Err(Error::EnvReadOnly);
        }
        if pid < META_PAGES || pid >= self.max_pages {
            return Err(Error::PageNotFound);
        }
        let buf = encode_node(&node)?;
        let off = (pid * PAGE_SIZE as u64) as usize;
        let slot = &mut self.map[off..off + PAGE_SIZE];
        slot[..buf.len()].copy_from_slice(&buf);
        for b in &mut slot[buf.len()..] {
            *b = 0;
        }
        self.cache.insert(pid, node);
        Ok(())
    }

    /// Publish the current `self.meta` as the new durable snapshot: flush
    /// data pages, then write and flush the alternate meta slot.
    pub fn publish(&mut self) -> Result<()> {
        if self.readonly {
            return Err(Error::EnvReadOnly);
        }
        if !self.no_sync {
            self.map.flush()?;
        }
        let slot = 1 - self.meta_slot;
        self.write_meta_slot(slot)?;
        self.flush_meta(slot)?;
        self.meta_slot = slot;
        Ok(())
    }

    /// Flush OS buffers for the whole map.
    pub fn sync(&self, force: bool) -> Result<()> {
        if self.readonly {
            return Err(Error::EnvReadOnly);
        }
        if force || !self.no_sync {
            self.map.flush()?;
        }
        if force {
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Snapshot of the free list plus everything pending, for persisting in
    /// the meta page (no readers exist at open time).
    pub fn persistable_free(&self) -> Vec<PageId> {
        let mut all = self.free.clone();
        for (_, pages) in &self.pending {
            all.extend_from_slice(pages);
        }
        all
    }

    pub fn next_page(&self) -> PageId {
        self.next_page
    }
}
