// SPDX-License-Identifier: Apache-2.0

//! Guest-physical memory map backed by host mappings.

use std::fs::File;

use lset::Span;
use mmarinus::{perms, Map};
use x86_64::{align_up, PhysAddr, VirtAddr};

use crate::error::{Error, Result};
use crate::x86::{PAGE_SHIFT, PAGE_SIZE};

bitflags::bitflags! {
    /// Guest access permissions for a region.
    ///
    /// `READ` is implied for any region that exists; the map adds it on
    /// insertion.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

/// Host backing for one guest region.
enum Backing {
    /// Private anonymous mapping, writable on the host.
    Anon(Map<perms::ReadWrite>),
    /// Private read-only mapping of the leading bytes of a file. Stays
    /// valid after the descriptor is closed.
    File(Map<perms::Read>),
}

impl Backing {
    fn addr(&self) -> usize {
        match self {
            Backing::Anon(map) => map.addr(),
            Backing::File(map) => map.addr(),
        }
    }

    fn size(&self) -> usize {
        match self {
            Backing::Anon(map) => map.size(),
            Backing::File(map) => map.size(),
        }
    }
}

/// A contiguous span of guest-physical memory and its host backing.
///
/// Guest frame numbers are inclusive on both ends. Boundaries are
/// page-aligned in both guest and host space.
pub struct GuestRegion {
    first_gfn: u64,
    last_gfn: u64,
    prot: Prot,
    backing: Backing,
}

impl GuestRegion {
    pub fn first_gfn(&self) -> u64 {
        self.first_gfn
    }

    pub fn last_gfn(&self) -> u64 {
        self.last_gfn
    }

    pub fn prot(&self) -> Prot {
        self.prot
    }

    /// Whether the host backing is a read-only file mapping.
    pub fn is_read_only(&self) -> bool {
        matches!(self.backing, Backing::File(_))
    }

    pub fn as_guest(&self) -> Span<PhysAddr, u64> {
        Span {
            start: PhysAddr::new(self.first_gfn << PAGE_SHIFT),
            count: self.backing.size() as u64,
        }
    }

    pub fn as_virt(&self) -> Span<VirtAddr, u64> {
        Span {
            start: VirtAddr::new(self.backing.addr() as u64),
            count: self.backing.size() as u64,
        }
    }

    #[allow(dead_code)]
    pub fn backing(&self) -> &[u8] {
        match &self.backing {
            Backing::Anon(map) => map,
            Backing::File(map) => map,
        }
    }

    /// Host-writable view of the backing. `None` for file-backed regions.
    pub fn backing_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.backing {
            Backing::Anon(map) => Some(map),
            Backing::File(_) => None,
        }
    }
}

/// Ordered set of non-overlapping guest regions.
///
/// Regions are kept sorted by `first_gfn`; page-table construction depends
/// on the ascending iteration order. Mutation is confined to the load
/// phase, before [`finalize`](Self::finalize).
#[derive(Default)]
pub struct MemoryMap {
    regions: Vec<GuestRegion>,
    finalized: bool,
}

impl MemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates host backing for `[gpa, gpa + size)` rounded up to page
    /// granularity and inserts the region into the map.
    ///
    /// With a file the region becomes a read-only mapping of the file's
    /// leading bytes; otherwise it is zero-filled anonymous memory.
    /// Returns the index of the inserted region.
    pub fn map_host_memory(
        &mut self,
        gpa: u64,
        size: usize,
        file: Option<&mut File>,
        prot: Prot,
    ) -> Result<usize> {
        if self.finalized {
            return Err(Error::InvalidArg("memory map is finalized"));
        }

        if size == 0 {
            return Err(Error::InvalidArg("zero-length guest region"));
        }

        if gpa % PAGE_SIZE != 0 {
            return Err(Error::InvalidArg("guest address is not page-aligned"));
        }

        let size = align_up(size as u64, PAGE_SIZE);
        let first_gfn = gpa >> PAGE_SHIFT;
        let last_gfn = (gpa + size - 1) >> PAGE_SHIFT;

        let idx = match self
            .regions
            .binary_search_by_key(&first_gfn, |r| r.first_gfn)
        {
            Ok(idx) => {
                return Err(Error::Conflict {
                    new: first_gfn,
                    existing: self.regions[idx].first_gfn,
                })
            }
            Err(idx) => idx,
        };

        if idx > 0 && self.regions[idx - 1].last_gfn >= first_gfn {
            return Err(Error::Conflict {
                new: first_gfn,
                existing: self.regions[idx - 1].first_gfn,
            });
        }

        if idx < self.regions.len() && self.regions[idx].first_gfn <= last_gfn {
            return Err(Error::Conflict {
                new: first_gfn,
                existing: self.regions[idx].first_gfn,
            });
        }

        let backing = match file {
            Some(file) => Backing::File(
                Map::bytes(size as usize)
                    .anywhere()
                    .from(file, 0)
                    .with(perms::Read)
                    .map_err(|e| Error::OutOfMemory(e.err))?,
            ),
            None => Backing::Anon(
                Map::bytes(size as usize)
                    .anywhere()
                    .anonymously()
                    .with(perms::ReadWrite)
                    .map_err(|e| Error::OutOfMemory(e.err))?,
            ),
        };

        self.regions.insert(
            idx,
            GuestRegion {
                first_gfn,
                last_gfn,
                prot: prot | Prot::READ,
                backing,
            },
        );

        Ok(idx)
    }

    /// Regions in ascending `first_gfn` order.
    pub fn iter(&self) -> impl Iterator<Item = &GuestRegion> {
        self.regions.iter()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    #[allow(dead_code)]
    pub fn region(&self, idx: usize) -> &GuestRegion {
        &self.regions[idx]
    }

    pub fn region_mut(&mut self, idx: usize) -> &mut GuestRegion {
        &mut self.regions[idx]
    }

    /// Drops every region and its host backing, returning the map to the
    /// pre-load state. Idempotent.
    pub fn clear(&mut self) {
        self.regions.clear();
        self.finalized = false;
    }

    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}
