// SPDX-License-Identifier: Apache-2.0

//! Thin binding to the KVM driver: one VM with one vCPU.

use std::io;

use kvm_bindings::{
    kvm_dtable, kvm_regs, kvm_segment, kvm_userspace_memory_region, KVM_MAX_CPUID_ENTRIES,
    KVM_MEM_READONLY,
};
use kvm_ioctls::{Kvm, VcpuExit, VcpuFd, VmFd};
use tracing::trace;

use crate::error::{Error, Result};
use crate::mem::MemoryMap;
use crate::x86::{SegFlags, Segment, X86CpuState};

/// Exit descriptor handed to the run-loop dispatcher.
pub enum VmExit {
    /// Guest port I/O. `value` carries the first byte written for OUT
    /// exits; IN exits have none.
    Io { port: u16, value: Option<u8> },
    /// Any other exit reason, rendered for diagnostics.
    Other(String),
}

pub struct KvmVm {
    vm: VmFd,
    vcpu: VcpuFd,
}

fn io_err(e: kvm_ioctls::Error) -> Error {
    Error::Io(io::Error::from_raw_os_error(e.errno()))
}

impl KvmVm {
    /// Opens `/dev/kvm` and creates a VM with a single vCPU.
    ///
    /// Opening the device is the only process-wide step and is naturally
    /// idempotent; each instance owns its own VM and vCPU descriptors.
    pub fn new() -> Result<Self> {
        let kvm = Kvm::new().map_err(Error::NotAvailable)?;
        let vm = kvm.create_vm().map_err(Error::NotAvailable)?;
        let vcpu = vm.create_vcpu(0).map_err(Error::NotAvailable)?;

        let cpuid = kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .map_err(Error::NotAvailable)?;
        vcpu.set_cpuid2(&cpuid).map_err(Error::NotAvailable)?;

        Ok(Self { vm, vcpu })
    }

    /// Registers every region of a finalized map as a guest-physical slot.
    pub fn set_memory_map(&mut self, map: &MemoryMap) -> Result<()> {
        for (slot, region) in map.iter().enumerate() {
            let guest = region.as_guest();
            let virt = region.as_virt();

            let kvm_region = kvm_userspace_memory_region {
                slot: slot as u32,
                flags: if region.is_read_only() {
                    KVM_MEM_READONLY
                } else {
                    0
                },
                guest_phys_addr: guest.start.as_u64(),
                memory_size: guest.count,
                userspace_addr: virt.start.as_u64(),
            };

            trace!(
                slot,
                gpa = kvm_region.guest_phys_addr,
                size = kvm_region.memory_size,
                read_only = region.is_read_only(),
                "registering guest memory slot"
            );

            unsafe { self.vm.set_user_memory_region(kvm_region) }.map_err(io_err)?;
        }

        Ok(())
    }

    /// Pushes the full register image into the vCPU.
    pub fn load_state(&mut self, cpu: &X86CpuState) -> Result<()> {
        let regs = kvm_regs {
            rax: cpu.rax,
            rbx: cpu.rbx,
            rcx: cpu.rcx,
            rdx: cpu.rdx,
            rsi: cpu.rsi,
            rdi: cpu.rdi,
            rsp: cpu.rsp,
            rbp: cpu.rbp,
            r8: cpu.r8,
            r9: cpu.r9,
            r10: cpu.r10,
            r11: cpu.r11,
            r12: cpu.r12,
            r13: cpu.r13,
            r14: cpu.r14,
            r15: cpu.r15,
            rip: cpu.rip,
            rflags: cpu.rflags,
        };
        self.vcpu.set_regs(&regs).map_err(io_err)?;

        let mut sregs = self.vcpu.get_sregs().map_err(io_err)?;
        sregs.cs = kvm_segment_from(&cpu.cs);
        sregs.ds = kvm_segment_from(&cpu.ds);
        sregs.es = kvm_segment_from(&cpu.es);
        sregs.fs = kvm_segment_from(&cpu.fs);
        sregs.gs = kvm_segment_from(&cpu.gs);
        sregs.ss = kvm_segment_from(&cpu.ss);
        sregs.tr = kvm_segment_from(&cpu.tr);
        sregs.ldt = kvm_segment_from(&cpu.ldt);
        // Zero-limit descriptor tables: any guest exception triple-faults.
        sregs.gdt = kvm_dtable::default();
        sregs.idt = kvm_dtable::default();
        sregs.cr0 = cpu.cr0;
        sregs.cr2 = cpu.cr2;
        sregs.cr3 = cpu.cr3;
        sregs.cr4 = cpu.cr4;
        sregs.efer = cpu.efer;
        self.vcpu.set_sregs(&sregs).map_err(io_err)
    }

    /// Reads the vCPU back into the register image.
    pub fn store_state(&mut self, cpu: &mut X86CpuState) -> Result<()> {
        let regs = self.vcpu.get_regs().map_err(io_err)?;
        cpu.rax = regs.rax;
        cpu.rbx = regs.rbx;
        cpu.rcx = regs.rcx;
        cpu.rdx = regs.rdx;
        cpu.rsi = regs.rsi;
        cpu.rdi = regs.rdi;
        cpu.rsp = regs.rsp;
        cpu.rbp = regs.rbp;
        cpu.r8 = regs.r8;
        cpu.r9 = regs.r9;
        cpu.r10 = regs.r10;
        cpu.r11 = regs.r11;
        cpu.r12 = regs.r12;
        cpu.r13 = regs.r13;
        cpu.r14 = regs.r14;
        cpu.r15 = regs.r15;
        cpu.rip = regs.rip;
        cpu.rflags = regs.rflags;

        let sregs = self.vcpu.get_sregs().map_err(io_err)?;
        cpu.cr0 = sregs.cr0;
        cpu.cr2 = sregs.cr2;
        cpu.cr3 = sregs.cr3;
        cpu.cr4 = sregs.cr4;
        cpu.efer = sregs.efer;
        cpu.cs = segment_from_kvm(&sregs.cs);
        cpu.ds = segment_from_kvm(&sregs.ds);
        cpu.es = segment_from_kvm(&sregs.es);
        cpu.fs = segment_from_kvm(&sregs.fs);
        cpu.gs = segment_from_kvm(&sregs.gs);
        cpu.ss = segment_from_kvm(&sregs.ss);
        cpu.tr = segment_from_kvm(&sregs.tr);
        cpu.ldt = segment_from_kvm(&sregs.ldt);

        Ok(())
    }

    /// Runs the vCPU until the next exit.
    pub fn run(&mut self) -> Result<VmExit> {
        match self.vcpu.run().map_err(io_err)? {
            VcpuExit::IoOut(port, data) => Ok(VmExit::Io {
                port,
                value: data.first().copied(),
            }),
            VcpuExit::IoIn(port, _) => Ok(VmExit::Io { port, value: None }),
            reason => Ok(VmExit::Other(format!("{reason:?}"))),
        }
    }
}

fn kvm_segment_from(seg: &Segment) -> kvm_segment {
    kvm_segment {
        base: seg.base,
        limit: seg.limit,
        selector: seg.selector,
        type_: seg.type_,
        present: seg.flags.contains(SegFlags::P) as u8,
        dpl: seg.dpl,
        db: seg.flags.contains(SegFlags::DB) as u8,
        s: seg.flags.contains(SegFlags::S) as u8,
        l: seg.flags.contains(SegFlags::L) as u8,
        g: seg.flags.contains(SegFlags::G) as u8,
        avl: 0,
        unusable: 0,
        padding: 0,
    }
}

fn segment_from_kvm(seg: &kvm_segment) -> Segment {
    let mut flags = SegFlags::empty();
    flags.set(SegFlags::S, seg.s != 0);
    flags.set(SegFlags::P, seg.present != 0);
    flags.set(SegFlags::G, seg.g != 0);
    flags.set(SegFlags::L, seg.l != 0);
    flags.set(SegFlags::DB, seg.db != 0);

    Segment {
        base: seg.base,
        limit: seg.limit,
        selector: seg.selector,
        type_: seg.type_,
        dpl: seg.dpl,
        flags,
    }
}
