//! Vm_R - The virtual-memory core of a teaching kernel
//!
//! Demand paging over a fixed pool of physical frames:
//! - frame allocation with clock/second-chance eviction to a swap store
//! - a per-process supplemental page table driving the page lifecycle
//! - cross-process sharing of read-only executable pages with
//!   copy-on-write
//! - memory-mapped files with dirty write-back on eviction and unmap
//!
//! The crate is the paging policy only. Hardware page tables, the swap
//! store, and the filesystem are consumed behind traits ([`PageDir`],
//! [`SwapDevice`], [`FileSystem`]); in-memory reference implementations
//! of each are included so the subsystem runs hosted, which is also how
//! the tests exercise it.
//!
//! Everything hangs off one [`Vm`] context constructed by the embedder
//! and passed by reference into the trap and syscall paths:
//!
//! - `Vm::page_fault(thread, addr, is_write)`
//! - `Vm::mmap(thread, fd, addr)` / `Vm::munmap(thread, id)`
//! - `Vm::register_segment(...)` from the exec loader
//! - `Vm::process_teardown(thread)` at exit

#![no_std]

extern crate alloc;

pub mod error;
pub mod fault;
pub mod filesys;
pub mod frame;
pub mod mmap;
pub mod page;
pub mod pagedir;
pub mod pool;
pub mod share;
pub mod swap;
pub mod thread;
pub mod types;
pub mod vm;

pub use error::{VmError, VmResult};
pub use filesys::{FileSystem, MemFs};
pub use frame::FrameTable;
pub use mmap::{MmapRegion, MmapTable};
pub use page::{FileSpan, PageEntry, PageState, Spt};
pub use pagedir::{PageDir, SoftPageDir};
pub use pool::PagePool;
pub use share::{ShareHandle, SharingRegistry};
pub use swap::{MemSwap, SwapDevice};
pub use thread::{FdTable, Thread, FD_CONSOLE_IN, FD_CONSOLE_OUT, MAX_OPEN_FILES};
pub use types::{
    is_page_aligned, page_offset, round_page, trunc_page, FileId, Frame, MapId, SwapSlot,
    ThreadId, VirtAddr, PAGE_SHIFT, PAGE_SIZE, STACK_MAX, STACK_SLOP, USER_TOP,
};
pub use vm::Vm;
