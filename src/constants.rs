use bitflags::bitflags;

// Environment flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnvFlags: u32 {
        const NOSUBDIR = 0x4000;
        const NOSYNC = 0x10000;
        const RDONLY = 0x20000;
        const NOMETASYNC = 0x40000;
    }
}

// Database flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DbFlags: u32 {
        const DUPSORT = 0x04;
        const CREATE = 0x40000;
    }
}

// Write operation flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WriteFlags: u32 {
        const NOOVERWRITE = 0x10;
        const NODUPDATA = 0x20;
    }
}

// Transaction flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TxnFlags: u32 {
        const RDONLY = EnvFlags::RDONLY.bits();
    }
}

// Flat store open flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StoreFlags: u32 {
        const CREATE = 0x01;
        const RDONLY = 0x02;
        const TRUNCATE = 0x04;
        const NOSYNC = 0x08;
    }
}

/// Size of a database page. Fixed at environment open time.
pub const PAGE_SIZE: usize = 4096;
/// Magic number identifying an emberdb data file
pub const EMBER_MAGIC: u32 = 0xEDB_F11E;
/// On-disk format version
pub const FORMAT_VERSION: u32 = 1;
/// Number of meta page slots at the front of the file
pub const META_PAGES: u64 = 2;
/// Default size of the memory map
pub const DEFAULT_MAP_SIZE: usize = 8 << 20;
/// Default maximum number of named databases
pub const DEFAULT_MAX_DBS: u32 = 16;
/// Default maximum number of concurrent read-only transactions
pub const DEFAULT_MAX_READERS: u32 = 126;
/// Longest accepted key, in bytes
pub const MAX_KEY_SIZE: usize = 511;
/// Bytes of a page usable for node entries
pub const PAGE_CAPACITY: usize = PAGE_SIZE - 8;
/// Largest encoded leaf entry; keeps any two-way node split valid
pub const MAX_ENTRY_SIZE: usize = PAGE_CAPACITY / 2;
