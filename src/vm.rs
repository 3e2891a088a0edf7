// SPDX-License-Identifier: Apache-2.0

//! Instance lifecycle and the vCPU run loop.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::kvm::{KvmVm, VmExit};
use crate::loader::{self, Format};
use crate::mem::MemoryMap;
use crate::paging;
use crate::x86::{Registers, X86CpuState};

/// Guest ABI: writing any value to this port ends the current
/// [`call`](Ivee::call). Direction and width do not matter; the value
/// written is surfaced in diagnostics only.
pub const PIO_EXIT_PORT: u16 = 0xFF;

/// Capability bits understood by this build. None are defined yet.
pub fn platform_capabilities() -> u64 {
    0
}

/// One sandboxed virtual machine: a single-vCPU KVM VM plus the guest
/// address space produced by [`load_executable`](Ivee::load_executable).
///
/// Dropping the instance releases the vCPU, the VM and every host-backed
/// guest region.
pub struct Ivee {
    vm: KvmVm,
    memory_map: MemoryMap,
    x86_cpu: X86CpuState,
    entry_addr: u64,
    should_terminate: bool,
}

impl Ivee {
    /// Creates an empty instance.
    ///
    /// `caps` requests optional capabilities; bits outside
    /// [`platform_capabilities`] are rejected before any resource is
    /// acquired.
    pub fn new(caps: u64) -> Result<Self> {
        let unknown = caps & !platform_capabilities();
        if unknown != 0 {
            return Err(Error::Unsupported(format!(
                "unknown capability bits {unknown:#x}"
            )));
        }

        Ok(Self {
            vm: KvmVm::new()?,
            memory_map: MemoryMap::new(),
            x86_cpu: X86CpuState::default(),
            entry_addr: 0,
            should_terminate: false,
        })
    }

    /// Loads the executable at `path`, builds the guest page tables and
    /// primes the boot processor state.
    ///
    /// On failure the accumulated memory map is dropped and the instance
    /// returns to the pre-load state, so loading can be retried.
    pub fn load_executable(&mut self, path: impl AsRef<Path>, format: Format) -> Result<()> {
        let path = path.as_ref();

        if self.memory_map.is_finalized() {
            return Err(Error::InvalidArg("an executable is already loaded"));
        }

        // Policy check: the caller must hold read and execute access.
        check_rx_access(path)?;

        match self.try_load(path, format) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.memory_map.clear();
                self.entry_addr = 0;
                Err(e)
            }
        }
    }

    fn try_load(&mut self, path: &Path, format: Format) -> Result<()> {
        self.entry_addr = loader::load(&mut self.memory_map, path, format)?;
        paging::build(&mut self.memory_map)?;
        self.memory_map.finalize();
        self.vm.set_memory_map(&self.memory_map)?;
        self.x86_cpu = X86CpuState::boot();

        debug!(
            entry = self.entry_addr,
            regions = self.memory_map.len(),
            "guest address space ready"
        );
        Ok(())
    }

    /// Runs the guest from its entry point as if calling a function.
    ///
    /// Caller registers seed the guest's register file; the guest runs
    /// until it writes to [`PIO_EXIT_PORT`], at which point the final
    /// register values are copied back into `regs`. On failure `regs` is
    /// left untouched.
    pub fn call(&mut self, regs: &mut Registers) -> Result<()> {
        if !self.memory_map.is_finalized() {
            return Err(Error::InvalidArg("no executable loaded"));
        }

        self.load_vcpu_state(regs)?;
        self.should_terminate = false;

        while !self.should_terminate {
            match self.vm.run()? {
                VmExit::Io { port, value } => self.handle_pio(port, value)?,
                VmExit::Other(reason) => {
                    return Err(Error::Unsupported(format!("unhandled vm exit: {reason}")))
                }
            }
        }

        self.store_vcpu_state(regs)
    }

    fn load_vcpu_state(&mut self, regs: &Registers) -> Result<()> {
        let cpu = &mut self.x86_cpu;
        cpu.rax = regs.rax;
        cpu.rbx = regs.rbx;
        cpu.rcx = regs.rcx;
        cpu.rdx = regs.rdx;
        cpu.rsi = regs.rsi;
        cpu.rdi = regs.rdi;
        cpu.rbp = regs.rbp;
        cpu.r8 = regs.r8;
        cpu.r9 = regs.r9;
        cpu.r10 = regs.r10;
        cpu.r11 = regs.r11;
        cpu.r12 = regs.r12;
        cpu.r13 = regs.r13;
        cpu.r14 = regs.r14;
        cpu.r15 = regs.r15;
        // RSP stays zero: the guest image establishes its own stack.
        cpu.rip = self.entry_addr;

        self.vm.load_state(&self.x86_cpu)
    }

    fn store_vcpu_state(&mut self, regs: &mut Registers) -> Result<()> {
        self.vm.store_state(&mut self.x86_cpu)?;

        // rbp is seeded into the guest but not reported back.
        let cpu = &self.x86_cpu;
        regs.rax = cpu.rax;
        regs.rbx = cpu.rbx;
        regs.rcx = cpu.rcx;
        regs.rdx = cpu.rdx;
        regs.rsi = cpu.rsi;
        regs.rdi = cpu.rdi;
        regs.r8 = cpu.r8;
        regs.r9 = cpu.r9;
        regs.r10 = cpu.r10;
        regs.r11 = cpu.r11;
        regs.r12 = cpu.r12;
        regs.r13 = cpu.r13;
        regs.r14 = cpu.r14;
        regs.r15 = cpu.r15;

        Ok(())
    }

    fn handle_pio(&mut self, port: u16, value: Option<u8>) -> Result<()> {
        match port {
            PIO_EXIT_PORT => {
                debug!(port, value = ?value, "guest signaled termination");
                self.should_terminate = true;
                Ok(())
            }
            _ => {
                trace!(port, "guest i/o on unhandled port");
                Err(Error::Unsupported(format!(
                    "guest i/o on unhandled port {port:#x}"
                )))
            }
        }
    }
}

fn check_rx_access(path: &Path) -> Result<()> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidArg("path contains a NUL byte"))?;

    if unsafe { libc::access(cpath.as_ptr(), libc::R_OK | libc::X_OK) } != 0 {
        return Err(Error::InvalidArg("file must be readable and executable"));
    }

    Ok(())
}
