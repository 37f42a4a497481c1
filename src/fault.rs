//! Fault Resolution
//!
//! Entry point for page faults. The descriptor is inspected under the
//! SPT lock, a load plan is copied out, and the lock is dropped before
//! any allocation or I/O; allocation can trigger eviction, and eviction
//! must be free to lock this process's SPT. One process has one thread,
//! so the descriptor cannot change behind the load except through
//! eviction, which only touches resident pages.
//!
//! ## Fault Kinds
//!
//! - **Zero-fill**: fresh stack pages and zero segment pages
//! - **Segment/file load**: content re-derived from a file span
//! - **Swap-in**: evicted content brought back, slot freed
//! - **Copy-on-write**: write against a shared read-only frame

use alloc::sync::Arc;

use crate::error::{VmError, VmResult};
use crate::frame;
use crate::page::{FileSpan, PageEntry, PageState};
use crate::share::{self, CowOutcome};
use crate::thread::Thread;
use crate::types::{trunc_page, Frame, SwapSlot, VirtAddr, STACK_MAX, STACK_SLOP, USER_TOP};
use crate::vm::Vm;

// ============================================================================
// Load Plans
// ============================================================================

enum Plan {
    /// Already resident and permitted; nothing to do.
    Done,
    /// Write against a shared read-only frame.
    CopyOnWrite,
    /// Zero-filled page (stack or zero segment page).
    Zero { writable: bool },
    /// Read-only file span, routed through the sharing registry.
    Shared { span: FileSpan },
    /// Private file span load.
    File { span: FileSpan, writable: bool },
    /// Memory-mapped page load.
    Mmap { span: FileSpan },
    /// Swapped content brought back.
    Swap { slot: SwapSlot, writable: bool },
}

/// Where an installed frame lands in the descriptor.
enum Target {
    Resident,
    Mapped,
}

// ============================================================================
// Entry Point
// ============================================================================

/// Resolve one fault for `thread` at `addr`.
pub(crate) fn handle_fault(
    vm: &Vm,
    thread: &Arc<Thread>,
    addr: VirtAddr,
    is_write: bool,
) -> VmResult<()> {
    if addr >= USER_TOP {
        return Err(VmError::InvalidAccess);
    }
    let vpage = trunc_page(addr);

    loop {
        let plan = {
            let mut spt = thread.spt.lock();
            if spt.find(vpage).is_none() {
                if !within_stack_growth(thread, addr) {
                    return Err(VmError::InvalidAccess);
                }
                // Fresh zero-filled stack page; it loads through the
                // normal Unloaded path below.
                spt.insert(vpage, PageEntry::unloaded(None, true));
            }
            let entry = spt.find_mut(vpage).expect("descriptor present");
            match entry.state {
                PageState::Resident { frame } => {
                    if is_write && entry.share.is_some() {
                        Plan::CopyOnWrite
                    } else if is_write && !entry.writable {
                        return Err(VmError::InvalidAccess);
                    } else {
                        // Spurious fault; renew the second chance.
                        vm.frames().mark_referenced(frame);
                        Plan::Done
                    }
                }
                PageState::Mapped { frame: Some(frame) } => {
                    vm.frames().mark_referenced(frame);
                    Plan::Done
                }
                PageState::Unloaded | PageState::FileBacked => match entry.span {
                    None => {
                        if is_write && !entry.writable {
                            return Err(VmError::InvalidAccess);
                        }
                        Plan::Zero {
                            writable: entry.writable,
                        }
                    }
                    Some(span) => {
                        if !entry.writable && !is_write {
                            Plan::Shared { span }
                        } else {
                            // A write against a read-only span skips
                            // sharing and loads a private writable
                            // copy, the load-time face of COW.
                            Plan::File {
                                span,
                                writable: entry.writable || is_write,
                            }
                        }
                    }
                },
                PageState::Swapped { slot } => Plan::Swap {
                    slot,
                    writable: entry.writable,
                },
                PageState::Mapped { frame: None } => Plan::Mmap {
                    span: entry.span.expect("mmap descriptor without a file span"),
                },
            }
        };

        return match plan {
            Plan::Done => Ok(()),
            Plan::CopyOnWrite => match share::release_on_write(vm, thread, vpage)? {
                CowOutcome::Done => Ok(()),
                CowOutcome::Retry => continue,
            },
            Plan::Zero { writable } => {
                let frame = frame::allocate_frame(vm, true)?;
                finish_install(vm, thread, vpage, frame, writable, Target::Resident)
            }
            Plan::Shared { span } => share::acquire_read_only(vm, thread, vpage, span),
            Plan::File { span, writable } => {
                let frame = frame::allocate_frame(vm, true)?;
                load_span(vm, frame, span);
                finish_install(vm, thread, vpage, frame, writable, Target::Resident)
            }
            Plan::Mmap { span } => {
                let frame = frame::allocate_frame(vm, true)?;
                load_span(vm, frame, span);
                finish_install(vm, thread, vpage, frame, true, Target::Mapped)
            }
            Plan::Swap { slot, writable } => {
                let frame = frame::allocate_frame(vm, false)?;
                {
                    // SAFETY: freshly allocated and unmapped; this thread
                    // is the frame's only user.
                    let bytes = unsafe { vm.pool().frame_bytes(frame) };
                    vm.swap().lock().swap_in(slot, bytes);
                }
                finish_install(vm, thread, vpage, frame, writable, Target::Resident)?;
                // The slot outlives the install so a failed install keeps
                // the content recoverable.
                vm.swap().lock().free_slot(slot);
                Ok(())
            }
        };
    }
}

/// Whether a faulting address without a descriptor is legitimate stack
/// growth: inside the stack region and no further below the trapped
/// stack pointer than a push instruction reaches.
fn within_stack_growth(thread: &Thread, addr: VirtAddr) -> bool {
    addr >= USER_TOP - STACK_MAX && addr >= thread.user_sp().saturating_sub(STACK_SLOP)
}

// ============================================================================
// Install
// ============================================================================

/// Read a span's bytes into a zeroed frame under the file lock.
pub(crate) fn load_span(vm: &Vm, frame: Frame, span: FileSpan) {
    if span.bytes == 0 {
        return;
    }
    // SAFETY: the frame is freshly allocated and unmapped; this thread is
    // its only user.
    let bytes = unsafe { vm.pool().frame_bytes(frame) };
    let mut filesys = vm.filesys().lock();
    filesys.read_at(span.file, span.offset, &mut bytes[..span.bytes]);
}

/// Map a populated frame, flip the descriptor to its resident state, and
/// record frame ownership. On mapping failure the frame is unwound and
/// the descriptor keeps its pre-fault state.
fn finish_install(
    vm: &Vm,
    thread: &Arc<Thread>,
    vpage: VirtAddr,
    frame: Frame,
    writable: bool,
    target: Target,
) -> VmResult<()> {
    if !thread.pagedir.lock().map(vpage, frame, writable) {
        vm.pool().free(frame);
        log::warn!("{}: mapping install failed at {vpage:#x}", thread.name());
        return Err(VmError::AllocationFailure);
    }

    {
        let mut spt = thread.spt.lock();
        let entry = spt
            .find_mut(vpage)
            .expect("faulting page lost its descriptor");
        entry.writable = writable;
        entry.state = match target {
            Target::Resident => PageState::Resident { frame },
            Target::Mapped => PageState::Mapped { frame: Some(frame) },
        };
    }

    vm.frames().claim(frame, thread.id(), vpage);
    Ok(())
}
