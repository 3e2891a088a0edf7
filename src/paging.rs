// SPDX-License-Identifier: Apache-2.0

//! Identity-mapped guest page tables.
//!
//! The guest sees a fixed 1 GiB physical window mapped 1:1 with 4 KiB
//! pages. The full table footprint is static, so CR3 is a compile-time
//! constant:
//!
//! 1 PML4 + 1 PDPT + 1 PD + 512 PTs = 515 pages, placed at the top of the
//! window.

use std::mem::size_of;
use std::slice::from_raw_parts_mut;

use x86_64::structures::paging::PageTableFlags as Flags;

use crate::error::{Error, Result};
use crate::mem::{MemoryMap, Prot};
use crate::x86::{PAGE_SHIFT, PAGE_SIZE};

pub const GUEST_MEMORY_SIZE: u64 = 0x4000_0000;
pub const GUEST_PAGE_COUNT: u64 = GUEST_MEMORY_SIZE >> PAGE_SHIFT;

pub const PAGE_TABLE_PAGES: u64 = 515;
pub const PAGE_TABLE_SIZE: u64 = PAGE_TABLE_PAGES * PAGE_SIZE;

pub const PML4_BASE: u64 = GUEST_MEMORY_SIZE - PAGE_TABLE_SIZE;
pub const PDPT_BASE: u64 = PML4_BASE + PAGE_SIZE;
pub const PD_BASE: u64 = PDPT_BASE + PAGE_SIZE;
pub const PT_BASE: u64 = PD_BASE + PAGE_SIZE;

const ENTRIES_PER_PAGE: usize = (PAGE_SIZE as usize) / size_of::<u64>();

/// Builds the guest page tables from a fully loaded memory map.
///
/// Appends the page-table region itself to the map (so its pages are
/// identity-mapped like any other region, letting the guest edit its own
/// tables), then fills in present entries for every mapped GFN. PTE slots
/// for unmapped GFNs stay zero; the guest can populate them at runtime.
///
/// Returns the index of the page-table region.
pub fn build(map: &mut MemoryMap) -> Result<usize> {
    let gpt_idx = map.map_host_memory(
        PML4_BASE,
        PAGE_TABLE_SIZE as usize,
        None,
        Prot::READ | Prot::WRITE,
    )?;

    // The loader must keep every region inside the identity-mapped window.
    for region in map.iter() {
        if region.last_gfn() >= GUEST_PAGE_COUNT {
            return Err(Error::InvalidArg(
                "guest region outside the 1 GiB addressable window",
            ));
        }
    }

    let spans: Vec<(u64, u64, Prot)> = map
        .iter()
        .map(|r| (r.first_gfn(), r.last_gfn(), r.prot()))
        .collect();

    let Some(table) = map.region_mut(gpt_idx).backing_mut() else {
        return Err(Error::InvalidArg("page-table region must be anonymous"));
    };

    // The backing is page-aligned host memory, so reinterpreting it as
    // 64-bit table entries is sound.
    let entries =
        unsafe { from_raw_parts_mut(table.as_mut_ptr().cast::<u64>(), table.len() / size_of::<u64>()) };

    let (pml4, rest) = entries.split_at_mut(ENTRIES_PER_PAGE);
    let (pdpt, rest) = rest.split_at_mut(ENTRIES_PER_PAGE);
    let (pd, pte) = rest.split_at_mut(ENTRIES_PER_PAGE);

    // One PML4 and one PDPT entry cover the whole window.
    pml4.fill(0);
    pml4[0] = PDPT_BASE | Flags::PRESENT.bits();

    pdpt.fill(0);
    pdpt[0] = PD_BASE | Flags::PRESENT.bits();

    // The PD grants RW unconditionally; effective permissions are narrowed
    // at the PTE level.
    for (i, entry) in pd.iter_mut().enumerate() {
        *entry = (PT_BASE + PAGE_SIZE * i as u64) | (Flags::PRESENT | Flags::WRITABLE).bits();
    }

    pte.fill(0);

    for (first_gfn, last_gfn, prot) in spans {
        let mut flags = Flags::PRESENT;
        if prot.contains(Prot::WRITE) {
            flags |= Flags::WRITABLE;
        }
        if !prot.contains(Prot::EXEC) {
            flags |= Flags::NO_EXECUTE;
        }

        for gfn in first_gfn..=last_gfn {
            // PT pages are contiguous, so the PTE index is the GFN itself.
            pte[gfn as usize] = (gfn << PAGE_SHIFT) | flags.bits();
        }
    }

    Ok(gpt_idx)
}
