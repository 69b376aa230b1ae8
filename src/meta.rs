use crate::constants::{DbFlags, EMBER_MAGIC, FORMAT_VERSION, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::page::PageId;

/// Per-database record carried in the meta page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DbRecord {
    /// Database name; `None` for the anonymous default database
    pub name: Option<String>,
    /// Database flags fixed at first open
    pub flags: DbFlags,
    /// Root page of the database B-tree; `None` while empty
    pub root: Option<PageId>,
}

/// Meta page header. Two slots exist at the front of the file; the live
/// one is the valid slot with the higher generation.
#[derive(Debug, Clone)]
pub(crate) struct MetaHeader {
    /// Commit generation that published this meta
    pub gen: u64,
    /// High-water mark of allocated pages
    pub next_page: PageId,
    /// Root table, index is the dbi number
    pub dbs: Vec<DbRecord>,
    /// Reusable page numbers
    pub free: Vec<PageId>,
}

impl MetaHeader {
    pub fn initial() -> Self {
        MetaHeader {
            gen: 0,
            next_page: crate::constants::META_PAGES,
            dbs: vec![DbRecord {
                name: None,
                flags: DbFlags::empty(),
                root: None,
            }],
            free: Vec::new(),
        }
    }
}

/// Database statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    /// Size of a database page
    pub psize: u32,
    /// Depth (height) of the B-tree
    pub depth: u32,
    /// Number of internal (non-leaf) pages
    pub branch_pages: usize,
    /// Number of leaf pages
    pub leaf_pages: usize,
    /// Number of overflow pages
    pub overflow_pages: usize,
    /// Number of data entries
    pub entries: usize,
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::Corrupted);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u16(&mut self) -> Result<u16> {
        let raw = self.bytes(2)?.try_into().map_err(|_| Error::Corrupted)?;
        Ok(u16::from_le_bytes(raw))
    }

    fn u32(&mut self) -> Result<u32> {
        let raw = self.bytes(4)?.try_into().map_err(|_| Error::Corrupted)?;
        Ok(u32::from_le_bytes(raw))
    }

    fn u64(&mut self) -> Result<u64> {
        let raw = self.bytes(8)?.try_into().map_err(|_| Error::Corrupted)?;
        Ok(u64::from_le_bytes(raw))
    }
}

/// Encode a meta header into one page-sized buffer. The free list is
/// truncated if it would not fit; dropped pages stay allocated until the
/// next commit rewrites the list.
pub(crate) fn encode_meta(meta: &MetaHeader) -> Vec<u8> {
    let mut body = Vec::with_capacity(256);
    put_u32(&mut body, EMBER_MAGIC);
    put_u32(&mut body, FORMAT_VERSION);
    put_u64(&mut body, meta.gen);
    put_u64(&mut body, meta.next_page);
    put_u32(&mut body, meta.dbs.len() as u32);

    let mut db_bytes = Vec::new();
    for db in &meta.dbs {
        match &db.name {
            Some(name) => {
                db_bytes.push(1u8);
                put_u16(&mut db_bytes, name.len() as u16);
                db_bytes.extend_from_slice(name.as_bytes());
            }
            None => {
                db_bytes.push(0u8);
                put_u16(&mut db_bytes, 0);
            }
        }
        put_u32(&mut db_bytes, db.flags.bits());
        put_u64(&mut db_bytes, db.root.unwrap_or(0));
    }

    // 4 bytes free count, 4 bytes trailing crc
    let room = PAGE_SIZE.saturating_sub(body.len() + db_bytes.len() + 8);
    let keep = meta.free.len().min(room / 8);
    if keep < meta.free.len() {
        log::warn!(
            "meta free list truncated from {} to {} entries",
            meta.free.len(),
            keep
        );
    }
    put_u32(&mut body, keep as u32);
    body.extend_from_slice(&db_bytes);
    for pid in &meta.free[..keep] {
        put_u64(&mut body, *pid);
    }

    let crc = crc32fast::hash(&body);
    put_u32(&mut body, crc);
    body.resize(PAGE_SIZE, 0);
    body
}

/// Decode and validate one meta slot.
pub(crate) fn decode_meta(buf: &[u8]) -> Result<MetaHeader> {
    let mut r = Reader::new(buf);
    if r.u32()? != EMBER_MAGIC {
        return Err(Error::Corrupted);
    }
    if r.u32()? != FORMAT_VERSION {
        return Err(Error::VersionMismatch);
    }
    let gen = r.u64()?;
    let next_page = r.u64()?;
    let db_count = r.u32()? as usize;
    let free_count = r.u32()? as usize;
    if db_count == 0 || db_count > u16::MAX as usize || free_count > PAGE_SIZE / 8 {
        return Err(Error::Corrupted);
    }

    let mut dbs = Vec::with_capacity(db_count);
    for _ in 0..db_count {
        let named = r.bytes(1)?[0];
        let name_len = r.u16()? as usize;
        let name = match named {
            0 => None,
            1 => {
                let raw = r.bytes(name_len)?;
                Some(String::from_utf8(raw.to_vec()).map_err(|_| Error::Corrupted)?)
            }
            _ => return Err(Error::Corrupted),
        };
        let flags = DbFlags::from_bits(r.u32()?).ok_or(Error::Corrupted)?;
        let root = match r.u64()? {
            0 => None,
            pid => Some(pid),
        };
        dbs.push(DbRecord { name, flags, root });
    }

    let mut free = Vec::with_capacity(free_count);
    for _ in 0..free_count {
        free.push(r.u64()?);
    }

    let body_len = r.pos;
    let stored = r.u32()?;
    if crc32fast::hash(&buf[..body_len]) != stored {
        return Err(Error::Corrupted);
    }

    Ok(MetaHeader {
        gen,
        next_page,
        dbs,
        free,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_round_trip() {
        let meta = MetaHeader {
            gen: 42,
            next_page: 17,
            dbs: vec![
                DbRecord {
                    name: None,
                    flags: DbFlags::empty(),
                    root: Some(9),
                },
                DbRecord {
                    name: Some("catalog".to_string()),
                    flags: DbFlags::DUPSORT,
                    root: None,
                },
            ],
            free: vec![3, 5, 11],
        };

        let buf = encode_meta(&meta);
        assert_eq!(buf.len(), PAGE_SIZE);
        let back = decode_meta(&buf).unwrap();
        assert_eq!(back.gen, 42);
        assert_eq!(back.next_page, 17);
        assert_eq!(back.dbs, meta.dbs);
        assert_eq!(back.free, meta.free);
    }

    #[test]
    fn meta_rejects_bad_crc() {
        let mut buf = encode_meta(&MetaHeader::initial());
        buf[12] ^= 0xff;
        assert!(matches!(decode_meta(&buf), Err(Error::Corrupted)));
    }

    #[test]
    fn meta_rejects_wrong_magic() {
        let mut buf = encode_meta(&MetaHeader::initial());
        buf[0] ^= 0xff;
        assert!(matches!(decode_meta(&buf), Err(Error::Corrupted)));
    }
}
