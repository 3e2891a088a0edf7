// SPDX-License-Identifier: Apache-2.0

//! Error types for ivee.

use std::io;

use thiserror::Error;

/// Result type alias using ivee's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the ivee API.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied argument was rejected before any state changed.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    /// The request names something this implementation does not handle.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Host memory for a guest region could not be allocated or mapped.
    #[error("failed to allocate host memory for guest region")]
    OutOfMemory(#[source] io::Error),

    /// A new guest region would overlap one already in the memory map.
    #[error("guest region at gfn {new:#x} overlaps existing region at gfn {existing:#x}")]
    Conflict { new: u64, existing: u64 },

    /// Filesystem or hypervisor-driver failure.
    #[error("i/o error")]
    Io(#[from] io::Error),

    /// The KVM subsystem could not be opened or the VM could not be created.
    #[error("hypervisor not available")]
    NotAvailable(#[source] kvm_ioctls::Error),
}
