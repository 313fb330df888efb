//! Memory-mapped on-disk block file.
//!
//! The whole file is mapped whenever it is non-empty. Growth goes through
//! `File::set_len` followed by a fresh map; `alloc` takes `&mut self`, so
//! the compiler guarantees no slice into the old mapping survives the
//! remap. Read-only opens use an immutable map and refuse every mutation
//! with `ReadOnly`.
//!
//! Durability: writes land in the shared mapping and reach disk when the
//! OS decides to, or when [`MmapFile::sync`] flushes explicitly. Nothing
//! here syncs implicitly.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{bail, ensure, Result, WrapErr};
use memmap2::{Mmap, MmapMut};

use crate::error::Error;

use super::BlockFile;

#[derive(Debug)]
enum MapRegion {
    /// Zero-length file; nothing to map yet.
    Empty,
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

/// On-disk [`BlockFile`] backed by a full-file memory map.
#[derive(Debug)]
pub struct MmapFile {
    name: String,
    file: File,
    map: MapRegion,
    block_size: usize,
    count: u32,
    read_only: bool,
}

impl MmapFile {
    /// Opens (or creates, unless read-only) the named file. `block_size`
    /// must already be validated by the caller. `file_mode` applies to
    /// newly created files on unix.
    pub fn open<P: AsRef<Path>>(
        path: P,
        block_size: usize,
        read_only: bool,
        file_mode: u32,
    ) -> Result<Self> {
        let path = path.as_ref();

        let mut options = OpenOptions::new();
        options.read(true);
        if !read_only {
            options.write(true).create(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(file_mode);
            }
        }
        #[cfg(not(unix))]
        let _ = file_mode;

        let file = options
            .open(path)
            .wrap_err_with(|| format!("failed to open block file '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(
            len % block_size as u64 == 0,
            Error::corrupt(format!(
                "file '{}' size {} is not a multiple of block size {}",
                path.display(),
                len,
                block_size
            ))
        );

        let mut bf = Self {
            name: path.display().to_string(),
            file,
            map: MapRegion::Empty,
            block_size,
            count: (len / block_size as u64) as u32,
            read_only,
        };

        if len > 0 {
            bf.remap()?;
        }

        Ok(bf)
    }

    fn remap(&mut self) -> Result<()> {
        // SAFETY: mapping a file is unsafe because another process could
        // truncate or rewrite it underneath us. The engine assumes single
        // process ownership of its data file: the map's lifetime is tied to
        // this struct, every access is bounds-checked against `count`, and
        // the old map is dropped before a new one is installed.
        self.map = if self.read_only {
            let map = unsafe { Mmap::map(&self.file) }
                .wrap_err_with(|| format!("failed to memory-map '{}'", self.name))?;
            MapRegion::ReadOnly(map)
        } else {
            let map = unsafe { MmapMut::map_mut(&self.file) }
                .wrap_err_with(|| format!("failed to memory-map '{}'", self.name))?;
            MapRegion::ReadWrite(map)
        };
        Ok(())
    }

    fn offset(&self, id: u32) -> usize {
        id as usize * self.block_size
    }
}

impl BlockFile for MmapFile {
    fn alloc(&mut self, n: usize) -> Result<(u32, &mut [u8])> {
        if self.read_only {
            bail!(Error::ReadOnly);
        }
        ensure!(n > 0, "allocation must request at least one block");

        if let MapRegion::ReadWrite(map) = &self.map {
            map.flush_async()
                .wrap_err("failed to flush mapping before grow")?;
        }

        let first = self.count;
        let new_len = (self.count as u64 + n as u64) * self.block_size as u64;
        self.file
            .set_len(new_len)
            .wrap_err_with(|| format!("failed to extend '{}' to {} bytes", self.name, new_len))?;

        self.count += n as u32;
        self.remap()?;

        let offset = self.offset(first);
        match &mut self.map {
            MapRegion::ReadWrite(map) => Ok((first, &mut map[offset..])),
            _ => bail!("writable mapping missing after grow"),
        }
    }

    fn slice(&self, id: u32) -> Result<&[u8]> {
        ensure!(id < self.count, Error::PageNotFound { id });
        let offset = self.offset(id);
        match &self.map {
            MapRegion::ReadOnly(map) => Ok(&map[offset..]),
            MapRegion::ReadWrite(map) => Ok(&map[offset..]),
            MapRegion::Empty => bail!(Error::PageNotFound { id }),
        }
    }

    fn slice_mut(&mut self, id: u32) -> Result<&mut [u8]> {
        if self.read_only {
            bail!(Error::ReadOnly);
        }
        ensure!(id < self.count, Error::PageNotFound { id });
        let offset = self.offset(id);
        match &mut self.map {
            MapRegion::ReadWrite(map) => Ok(&mut map[offset..]),
            _ => bail!(Error::PageNotFound { id }),
        }
    }

    fn count(&self) -> u32 {
        self.count
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn sync(&self) -> Result<()> {
        match &self.map {
            MapRegion::ReadWrite(map) => map
                .flush()
                .wrap_err_with(|| format!("failed to sync '{}'", self.name)),
            _ => Ok(()),
        }
    }
}
