//! Page-granularity I/O over a block file.
//!
//! The pager is the only component permitted to mutate the block file. It
//! deals in whole pages: `read` copies a page out (so callers never hold a
//! reference into the mapping), `write` copies a buffer in, `alloc`
//! appends. `marshal`/`unmarshal` are thin wrappers over the binary-codec
//! traits used by tree nodes and metadata.
//!
//! Not internally synchronized; the owning tree serializes access. I/O
//! counters use relaxed atomics only so `read` can take `&self` under the
//! tree's reader lock.

use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{bail, ensure, Result};

use crate::error::Error;

use super::{open_block_file, BinaryMarshal, BinaryUnmarshal, BlockFile};

/// I/O statistics collected by a [`Pager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    pub reads: u64,
    pub writes: u64,
    pub allocs: u64,
}

#[derive(Debug, Default)]
struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
    allocs: AtomicU64,
}

/// Fixed-size page reader/writer/allocator over a [`BlockFile`].
pub struct Pager {
    file: Box<dyn BlockFile>,
    page_size: usize,
    counters: Counters,
}

impl Pager {
    /// Opens the named file (or `":memory:"`) with the given page size.
    /// A `page_size` of zero selects the OS page size.
    pub fn open(path: &str, page_size: usize, read_only: bool, file_mode: u32) -> Result<Self> {
        let file = open_block_file(path, page_size, read_only, file_mode)?;
        Ok(Self::with_file(file))
    }

    pub fn with_file(file: Box<dyn BlockFile>) -> Self {
        let page_size = file.block_size();
        Self {
            file,
            page_size,
            counters: Counters::default(),
        }
    }

    /// Allocates `n` sequential pages appended to the backing file and
    /// returns the id of the first.
    pub fn alloc(&mut self, n: usize) -> Result<u32> {
        let (first, _) = self.file.alloc(n)?;
        self.counters.allocs.fetch_add(1, Ordering::Relaxed);
        Ok(first)
    }

    /// Copies the page with the given id out of the backing file.
    pub fn read(&self, id: u32) -> Result<Vec<u8>> {
        let slice = self.file.slice(id)?;
        ensure!(
            slice.len() >= self.page_size,
            Error::corrupt(format!("page {} shorter than page size", id))
        );
        let page = slice[..self.page_size].to_vec();
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        Ok(page)
    }

    /// Writes `data` at the start of the page with the given id. `data`
    /// must not be larger than one page.
    pub fn write(&mut self, id: u32, data: &[u8]) -> Result<()> {
        if self.file.read_only() {
            bail!(Error::ReadOnly);
        }
        ensure!(
            data.len() <= self.page_size,
            "data of {} bytes does not fit a {} byte page",
            data.len(),
            self.page_size
        );

        let slice = self.file.slice_mut(id)?;
        slice[..data.len()].copy_from_slice(data);
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Serializes `v` into a zeroed page buffer and writes it to the page
    /// with the given id.
    pub fn marshal(&mut self, id: u32, v: &impl BinaryMarshal) -> Result<()> {
        let mut buf = vec![0u8; self.page_size];
        v.marshal_into(&mut buf)?;
        self.write(id, &buf)
    }

    /// Reads the page with the given id and deserializes it into `into`.
    pub fn unmarshal<T: BinaryUnmarshal + ?Sized>(&self, id: u32, into: &mut T) -> Result<()> {
        let page = self.read(id)?;
        into.unmarshal_from(&page)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn count(&self) -> u32 {
        self.file.count()
    }

    pub fn read_only(&self) -> bool {
        self.file.read_only()
    }

    pub fn name(&self) -> &str {
        self.file.name()
    }

    /// Flushes the backing file to durable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }

    pub fn stats(&self) -> Stats {
        Stats {
            reads: self.counters.reads.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            allocs: self.counters.allocs.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Pager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pager")
            .field("file", &self.file.name())
            .field("page_size", &self.page_size)
            .field("count", &self.count())
            .field("read_only", &self.read_only())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::IN_MEMORY_PATH;

    fn mem_pager() -> Pager {
        Pager::open(IN_MEMORY_PATH, 4096, false, 0o644).unwrap()
    }

    struct Blob(Vec<u8>);

    impl BinaryMarshal for Blob {
        fn marshal_into(&self, buf: &mut [u8]) -> Result<()> {
            buf[..self.0.len()].copy_from_slice(&self.0);
            Ok(())
        }
    }

    impl BinaryUnmarshal for Blob {
        fn unmarshal_from(&mut self, data: &[u8]) -> Result<()> {
            self.0 = data[..4].to_vec();
            Ok(())
        }
    }

    #[test]
    fn alloc_returns_sequential_ids() {
        let mut pager = mem_pager();

        assert_eq!(pager.alloc(2).unwrap(), 0);
        assert_eq!(pager.alloc(1).unwrap(), 2);
        assert_eq!(pager.count(), 3);
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut pager = mem_pager();
        pager.alloc(1).unwrap();

        pager.write(0, b"page zero").unwrap();

        let page = pager.read(0).unwrap();
        assert_eq!(page.len(), 4096);
        assert_eq!(&page[..9], b"page zero");
    }

    #[test]
    fn read_invalid_id_fails() {
        let pager = mem_pager();
        let err = pager.read(0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::PageNotFound { id: 0 })
        ));
    }

    #[test]
    fn write_larger_than_page_fails() {
        let mut pager = mem_pager();
        pager.alloc(1).unwrap();

        let result = pager.write(0, &vec![0u8; 4097]);
        assert!(result.is_err());
    }

    #[test]
    fn marshal_unmarshal_round_trip() {
        let mut pager = mem_pager();
        pager.alloc(1).unwrap();

        pager.marshal(0, &Blob(b"abcd".to_vec())).unwrap();

        let mut blob = Blob(Vec::new());
        pager.unmarshal(0, &mut blob).unwrap();
        assert_eq!(blob.0, b"abcd");
    }

    #[test]
    fn stats_count_operations() {
        let mut pager = mem_pager();
        pager.alloc(2).unwrap();
        pager.write(0, b"x").unwrap();
        pager.write(1, b"y").unwrap();
        pager.read(0).unwrap();

        let stats = pager.stats();
        assert_eq!(
            stats,
            Stats {
                reads: 1,
                writes: 2,
                allocs: 1
            }
        );
    }
}
