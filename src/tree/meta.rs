//! Page-0 tree metadata and its binary layout.
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -------------------------------
//! 0       2     magic (0xB7EE)
//! 2       1     format version (1)
//! 3       1     flags (reserved)
//! 4       2     max_key_size
//! 6       4     page_size
//! 10      4     size (entry count)
//! 14      4     root_id
//! 18      4     free_count
//! 22      4×N   free page ids
//! ```
//!
//! The remainder of the page is padding. A free list larger than the page
//! can hold is truncated on write with a warning; the lost ids become
//! permanently unused pages.

use eyre::{ensure, Result};
use tracing::warn;
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::Error;
use crate::storage::{BinaryMarshal, BinaryUnmarshal};

pub const META_MAGIC: u16 = 0xB7EE;
pub const META_VERSION: u8 = 1;
pub const META_HEADER_SIZE: usize = 22;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct MetaHeader {
    magic: U16,
    version: u8,
    flags: u8,
    max_key_size: U16,
    page_size: U32,
    size: U32,
    root_id: U32,
    free_count: U32,
}

const _: () = assert!(std::mem::size_of::<MetaHeader>() == META_HEADER_SIZE);

/// Tree metadata persisted in page 0.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    /// In-memory only; set when the record diverges from page 0.
    pub dirty: bool,

    pub magic: u16,
    pub version: u8,
    pub flags: u8,
    pub max_key_size: u16,
    pub page_size: u32,
    pub size: u32,
    pub root_id: u32,
    /// Allocated-but-unused page ids, kept sorted ascending.
    pub free_list: Vec<u32>,
}

impl Metadata {
    /// A fresh record for a newly initialized tree: root at page 1, dirty
    /// so the first flush persists it.
    pub fn new(page_size: u32, max_key_size: u16) -> Self {
        Self {
            dirty: true,
            magic: META_MAGIC,
            version: META_VERSION,
            flags: 0,
            max_key_size,
            page_size,
            size: 0,
            root_id: 1,
            free_list: Vec::new(),
        }
    }

    /// Validates a record loaded from disk against the pager it will be
    /// used with. Every violation refuses the open with `Corrupt`.
    pub fn validate(&self, pager_page_size: usize) -> Result<()> {
        ensure!(
            self.magic == META_MAGIC,
            Error::corrupt(format!("bad magic {:#06x} in metadata page", self.magic))
        );
        ensure!(
            self.version == META_VERSION,
            Error::corrupt(format!(
                "incompatible format version {} (expected {})",
                self.version, META_VERSION
            ))
        );
        ensure!(
            self.page_size as usize == pager_page_size,
            Error::corrupt(format!(
                "page size in metadata ({}) does not match pager ({})",
                self.page_size, pager_page_size
            ))
        );
        ensure!(
            self.root_id >= 1,
            Error::corrupt("metadata root_id points at the metadata page")
        );

        let mut seen = self.free_list.clone();
        seen.sort_unstable();
        for pair in seen.windows(2) {
            ensure!(
                pair[0] != pair[1],
                Error::corrupt(format!("duplicate page {} in free list", pair[0]))
            );
        }
        if let Some(&first) = seen.first() {
            ensure!(
                first > 1,
                Error::corrupt(format!("reserved page {} in free list", first))
            );
        }

        Ok(())
    }

    fn free_list_capacity(page_size: usize) -> usize {
        (page_size - META_HEADER_SIZE) / 4
    }
}

impl BinaryMarshal for Metadata {
    fn marshal_into(&self, buf: &mut [u8]) -> Result<()> {
        ensure!(
            buf.len() >= META_HEADER_SIZE,
            "page of {} bytes cannot hold tree metadata",
            buf.len()
        );

        let capacity = Self::free_list_capacity(buf.len());
        let mut persisted = self.free_list.len();
        if persisted > capacity {
            warn!(
                dropped = persisted - capacity,
                capacity, "free list does not fit the metadata page; truncating"
            );
            persisted = capacity;
        }

        let header = MetaHeader {
            magic: U16::new(self.magic),
            version: self.version,
            flags: self.flags,
            max_key_size: U16::new(self.max_key_size),
            page_size: U32::new(self.page_size),
            size: U32::new(self.size),
            root_id: U32::new(self.root_id),
            free_count: U32::new(persisted as u32),
        };
        buf[..META_HEADER_SIZE].copy_from_slice(header.as_bytes());

        let mut offset = META_HEADER_SIZE;
        for &id in &self.free_list[..persisted] {
            buf[offset..offset + 4].copy_from_slice(U32::new(id).as_bytes());
            offset += 4;
        }

        Ok(())
    }
}

impl BinaryUnmarshal for Metadata {
    fn unmarshal_from(&mut self, data: &[u8]) -> Result<()> {
        ensure!(
            data.len() >= META_HEADER_SIZE,
            Error::corrupt("metadata page too short")
        );

        let header = MetaHeader::ref_from_bytes(&data[..META_HEADER_SIZE])
            .map_err(|e| Error::corrupt(format!("bad metadata header: {e:?}")))?;

        self.magic = header.magic.get();
        self.version = header.version;
        self.flags = header.flags;
        self.max_key_size = header.max_key_size.get();
        self.page_size = header.page_size.get();
        self.size = header.size.get();
        self.root_id = header.root_id.get();

        let free_count = header.free_count.get() as usize;
        ensure!(
            META_HEADER_SIZE + free_count * 4 <= data.len(),
            Error::corrupt(format!(
                "free list of {} entries overruns the metadata page",
                free_count
            ))
        );

        self.free_list.clear();
        self.free_list.reserve(free_count);
        let mut offset = META_HEADER_SIZE;
        for _ in 0..free_count {
            self.free_list
                .push(u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()));
            offset += 4;
        }

        self.dirty = false;
        Ok(())
    }
}
