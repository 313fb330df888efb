//! # Storage Layer
//!
//! Raw paged I/O for the engine: fixed-size blocks addressed by a
//! non-negative id, backed either by a memory-mapped file on disk or by an
//! in-memory buffer for tests and ephemeral trees.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────┐
//! │   Pager (read/write/alloc)  │  whole-page copies, codec wrappers, stats
//! ├─────────────────────────────┤
//! │   BlockFile trait           │  block-granular slices
//! ├──────────────┬──────────────┤
//! │   MmapFile   │   MemFile    │  mmap'd file          Vec<u8> (":memory:")
//! └──────────────┴──────────────┘
//! ```
//!
//! The `Pager` is the only component that mutates a `BlockFile`. Everything
//! above it (the tree) speaks page ids and whole-page buffers.
//!
//! ## Safety Model
//!
//! The memory-mapped region becomes invalid when the file grows and is
//! remapped. `alloc` takes `&mut self`, so the borrow checker statically
//! prevents any slice returned by `slice`/`slice_mut` from surviving a
//! remap — no guards, epochs, or reference counting needed.
//!
//! ## Block Size
//!
//! Block size is established at creation: at least 4096 and a multiple of
//! 4096, defaulting to the OS page size when zero. The file size is always
//! an exact multiple of the block size.

mod mem;
mod mmap;
mod pager;

pub use mem::MemFile;
pub use mmap::MmapFile;
pub use pager::{Pager, Stats};

use eyre::{bail, Result};

/// Sentinel path selecting an in-memory block file with no persistence.
pub const IN_MEMORY_PATH: &str = ":memory:";

/// Minimum block size; block sizes must also be a multiple of this.
pub const MIN_BLOCK_SIZE: usize = 4096;

/// Types that serialize themselves into a page-sized buffer.
pub trait BinaryMarshal {
    /// Writes the binary form into `buf`. `buf` is page-sized and zeroed.
    fn marshal_into(&self, buf: &mut [u8]) -> Result<()>;
}

/// Types that deserialize themselves from a page buffer.
pub trait BinaryUnmarshal {
    /// Reads the binary form from `data`, replacing `self`'s contents.
    fn unmarshal_from(&mut self, data: &[u8]) -> Result<()>;
}

/// Low-level paged access to a file-like object.
///
/// Not internally synchronized; callers hold the tree's lock. Slices
/// returned by `slice`/`slice_mut` are invalidated by the next `alloc`,
/// which the borrow checker enforces.
pub trait BlockFile: Send + Sync {
    /// Allocates `n` new sequential blocks, extending the file. Returns the
    /// id of the first new block and a mutable slice starting at it.
    fn alloc(&mut self, n: usize) -> Result<(u32, &mut [u8])>;

    /// Returns a slice starting at the block with the given id and running
    /// to the end of the file.
    fn slice(&self, id: u32) -> Result<&[u8]>;

    /// Mutable variant of [`BlockFile::slice`]. Fails with `ReadOnly` on a
    /// read-only file.
    fn slice_mut(&mut self, id: u32) -> Result<&mut [u8]>;

    /// Number of blocks currently in the file.
    fn count(&self) -> u32;

    fn block_size(&self) -> usize;

    fn read_only(&self) -> bool;

    /// Display name (file path, or `":memory:"`).
    fn name(&self) -> &str;

    /// Flushes buffered writes to durable storage. No-op for in-memory
    /// files; the substrate never syncs implicitly.
    fn sync(&self) -> Result<()>;
}

/// Opens the named file as a block file. The sentinel `":memory:"` selects
/// an in-memory substitute. A `block_size` of zero selects the OS page
/// size; otherwise it must be a positive multiple of 4096.
pub fn open_block_file(
    path: &str,
    block_size: usize,
    read_only: bool,
    file_mode: u32,
) -> Result<Box<dyn BlockFile>> {
    let block_size = resolve_block_size(block_size)?;

    if path == IN_MEMORY_PATH {
        return Ok(Box::new(MemFile::new(block_size, read_only)));
    }

    let file = MmapFile::open(path, block_size, read_only, file_mode)?;
    Ok(Box::new(file))
}

fn resolve_block_size(block_size: usize) -> Result<usize> {
    if block_size == 0 {
        return Ok(os_page_size());
    }
    if block_size < MIN_BLOCK_SIZE || block_size % MIN_BLOCK_SIZE != 0 {
        bail!(
            "invalid block size {}: must be a positive multiple of {}",
            block_size,
            MIN_BLOCK_SIZE
        );
    }
    Ok(block_size)
}

/// The OS page size, falling back to 4096 where it cannot be queried.
pub fn os_page_size() -> usize {
    #[cfg(unix)]
    {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz >= MIN_BLOCK_SIZE as i64 {
            return sz as usize;
        }
    }
    MIN_BLOCK_SIZE
}
