//! VM Errors
//!
//! Failure kinds for the VM core. Kernel-fatal conditions (`OutOfMemory`)
//! are reported to the embedder, which halts; user-triggered failures
//! (`InvalidMapping`, `InvalidAccess`) stay isolated to the offending
//! process.

use thiserror::Error;

/// Errors produced by VM operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    /// The user pool and the swap device are both exhausted. Unrecoverable;
    /// the embedder is expected to halt the system.
    #[error("user pool and swap both exhausted")]
    OutOfMemory,

    /// Eviction found no free swap slot. Surfaced from frame allocation as
    /// [`VmError::OutOfMemory`].
    #[error("no free swap slot")]
    SwapExhausted,

    /// Rejected mmap arguments; the caller continues.
    #[error("invalid mmap request")]
    InvalidMapping,

    /// A fault outside every mapping and outside the stack growth bound.
    /// The caller terminates only the faulting process.
    #[error("access outside any mapping")]
    InvalidAccess,

    /// Metadata allocation failed despite an available frame; the frame is
    /// unwound and the process keeps running.
    #[error("metadata allocation failed")]
    AllocationFailure,
}

/// Result alias used across the crate.
pub type VmResult<T> = Result<T, VmError>;
