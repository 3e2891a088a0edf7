// SPDX-License-Identifier: Apache-2.0

//! x86_64 processor state for the boot vCPU.

use primordial::Page;
use x86_64::registers::control::{Cr0Flags, Cr4Flags};
use x86_64::registers::model_specific::EferFlags;

use crate::paging;

pub const PAGE_SIZE: u64 = Page::SIZE as u64;
pub const PAGE_SHIFT: u32 = 12;

/// Segment descriptor type for an execute/read code segment with the
/// accessed bit set.
pub const SEG_TYPE_CODE_ACCESSED: u8 = 0xb;

/// Segment descriptor type for a read/write data segment with the
/// accessed bit set.
pub const SEG_TYPE_DATA_ACCESSED: u8 = 0x3;

/// System descriptor type for a busy 32-bit task state segment.
pub const SEG_TYPE_TSS32: u8 = 0xb;

/// System descriptor type for a local descriptor table.
pub const SEG_TYPE_LDT: u8 = 0x2;

bitflags::bitflags! {
    /// Descriptor attribute bits tracked per segment.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SegFlags: u8 {
        /// Code/data (non-system) descriptor.
        const S = 1 << 0;
        /// Segment present.
        const P = 1 << 1;
        /// 4 KiB limit granularity.
        const G = 1 << 2;
        /// 64-bit code segment.
        const L = 1 << 3;
        /// 32-bit default operation size.
        const DB = 1 << 4;
    }
}

/// One segment register image.
#[derive(Clone, Copy, Debug, Default)]
pub struct Segment {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub type_: u8,
    pub dpl: u8,
    pub flags: SegFlags,
}

impl Segment {
    fn flat(selector: u16, limit: u32, type_: u8, flags: SegFlags) -> Self {
        Self {
            base: 0,
            limit,
            selector,
            type_,
            dpl: 0,
            flags,
        }
    }
}

/// Complete register image loaded into (and stored back from) the vCPU.
#[derive(Clone, Copy, Debug, Default)]
pub struct X86CpuState {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,

    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,

    pub cs: Segment,
    pub ds: Segment,
    pub ss: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub tr: Segment,
    pub ldt: Segment,
}

impl X86CpuState {
    /// Initial state for the boot processor, entering 64-bit long mode
    /// directly.
    ///
    /// GDT and IDT limits stay zero, so any guest exception ends in a
    /// triple fault. A guest runtime can install its own tables later.
    pub fn boot() -> Self {
        let data_flags = SegFlags::S | SegFlags::P | SegFlags::G | SegFlags::DB;
        let data = Segment::flat(0x10, 0xFFFF_FFFF, SEG_TYPE_DATA_ACCESSED, data_flags);

        // Segmentation is vestigial in long mode, but vmentry checks still
        // require a flat 64-bit segment model.
        Self {
            rflags: 0x2,
            cs: Segment::flat(
                0x8,
                0xFFFF_FFFF,
                SEG_TYPE_CODE_ACCESSED,
                SegFlags::S | SegFlags::P | SegFlags::G | SegFlags::L,
            ),
            ds: data,
            ss: data,
            es: data,
            fs: data,
            gs: data,
            tr: Segment::flat(0, 0, SEG_TYPE_TSS32, SegFlags::P),
            ldt: Segment::flat(0, 0, SEG_TYPE_LDT, SegFlags::P),
            cr0: (Cr0Flags::PAGING | Cr0Flags::WRITE_PROTECT | Cr0Flags::PROTECTED_MODE_ENABLE)
                .bits(),
            cr4: Cr4Flags::PHYSICAL_ADDRESS_EXTENSION.bits(),
            efer: (EferFlags::LONG_MODE_ENABLE | EferFlags::LONG_MODE_ACTIVE).bits(),
            cr3: paging::PML4_BASE,
            ..Self::default()
        }
    }
}

/// General-purpose register file passed to and returned from [`call`].
///
/// There is deliberately no `rsp` here: the guest ABI leaves the stack
/// pointer zero and expects the loaded image to establish its own stack
/// inside a writable region.
///
/// [`call`]: crate::Ivee::call
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_state_enters_long_mode() {
        let cpu = X86CpuState::boot();

        assert_eq!(cpu.cr0, 0x8001_0001, "PG | WP | PE");
        assert_eq!(cpu.cr4, 0x20, "PAE");
        assert_eq!(cpu.efer, 0x500, "LMA | LME");
        assert_eq!(cpu.cr3, paging::PML4_BASE);
        assert_eq!(cpu.rflags, 0x2);
        assert_eq!(cpu.rip, 0);
        assert_eq!(cpu.rsp, 0);
    }

    #[test]
    fn boot_segments_are_flat() {
        let cpu = X86CpuState::boot();

        assert_eq!(cpu.cs.selector, 0x8);
        assert_eq!(cpu.cs.base, 0);
        assert_eq!(cpu.cs.limit, 0xFFFF_FFFF);
        assert_eq!(cpu.cs.type_, SEG_TYPE_CODE_ACCESSED);
        assert!(cpu.cs.flags.contains(SegFlags::L));
        assert!(!cpu.cs.flags.contains(SegFlags::DB));

        for seg in [cpu.ds, cpu.ss, cpu.es, cpu.fs, cpu.gs] {
            assert_eq!(seg.selector, 0x10);
            assert_eq!(seg.limit, 0xFFFF_FFFF);
            assert_eq!(seg.type_, SEG_TYPE_DATA_ACCESSED);
            assert!(seg.flags.contains(SegFlags::DB));
            assert!(!seg.flags.contains(SegFlags::L));
        }

        assert_eq!(cpu.tr.selector, 0);
        assert_eq!(cpu.tr.limit, 0);
        assert_eq!(cpu.tr.flags, SegFlags::P);
        assert_eq!(cpu.ldt.type_, SEG_TYPE_LDT);
        assert_eq!(cpu.ldt.flags, SegFlags::P);
    }
}
