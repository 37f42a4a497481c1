//! Frame Table - Physical Frame Registry and Eviction
//!
//! Global registry of user-pool frames. Each slot records the owning
//! thread, the virtual page it backs, and one recency bit; the table owns
//! the clock/second-chance replacement policy.
//!
//! Two locks, deliberately split: the slot lock protects ownership
//! bookkeeping only and is held briefly, never across a content copy; the
//! eviction lock serializes every eviction system-wide so two threads can
//! never pick the same victim. Frame-freeing paths (copy-on-write,
//! munmap, teardown) take the eviction lock too, so a chosen victim
//! cannot be freed out from under the evictor.

use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{VmError, VmResult};
use crate::page::PageState;
use crate::share;
use crate::types::{Frame, ThreadId, VirtAddr};
use crate::vm::Vm;

// ============================================================================
// Table
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct FrameSlot {
    owner: Option<ThreadId>,
    vpage: VirtAddr,
    /// Recency bit for the clock scan; set on claim and on re-fault.
    referenced: bool,
}

struct FrameSlots {
    slots: Vec<FrameSlot>,
    /// Clock cursor; persists across evictions.
    hand: usize,
}

/// Registry of every frame in the user pool.
pub struct FrameTable {
    slots: Mutex<FrameSlots>,
    /// Serializes evictions and every frame-freeing path.
    pub(crate) eviction: Mutex<()>,
}

impl FrameTable {
    /// Zero-initialized slots, one per pool page.
    pub fn new(page_count: usize) -> Self {
        let empty = FrameSlot {
            owner: None,
            vpage: 0,
            referenced: false,
        };
        Self {
            slots: Mutex::new(FrameSlots {
                slots: alloc::vec![empty; page_count],
                hand: 0,
            }),
            eviction: Mutex::new(()),
        }
    }

    /// Record ownership of a freshly installed frame.
    pub(crate) fn claim(&self, frame: Frame, owner: ThreadId, vpage: VirtAddr) {
        let mut s = self.slots.lock();
        let slot = &mut s.slots[frame.index()];
        debug_assert!(slot.owner.is_none(), "frame already claimed");
        *slot = FrameSlot {
            owner: Some(owner),
            vpage,
            referenced: true,
        };
    }

    /// Clear a slot before its frame returns to the pool.
    pub(crate) fn unclaim(&self, frame: Frame) {
        let mut s = self.slots.lock();
        s.slots[frame.index()] = FrameSlot {
            owner: None,
            vpage: 0,
            referenced: false,
        };
    }

    /// Hand a still-live frame to a new owner (shared-frame teardown).
    pub(crate) fn transfer(&self, frame: Frame, owner: ThreadId, vpage: VirtAddr) {
        let mut s = self.slots.lock();
        let slot = &mut s.slots[frame.index()];
        slot.owner = Some(owner);
        slot.vpage = vpage;
    }

    /// Give a resident frame a second chance after a spurious fault.
    pub(crate) fn mark_referenced(&self, frame: Frame) {
        self.slots.lock().slots[frame.index()].referenced = true;
    }

    /// Owner currently recorded for `frame`.
    pub fn owner_of(&self, frame: Frame) -> Option<ThreadId> {
        self.slots.lock().slots[frame.index()].owner
    }

    /// Clear every slot owned by `thread`; teardown sweep after the SPT
    /// has been drained.
    pub(crate) fn release_owner(&self, thread: ThreadId) {
        let mut s = self.slots.lock();
        for slot in s.slots.iter_mut() {
            if slot.owner == Some(thread) {
                *slot = FrameSlot {
                    owner: None,
                    vpage: 0,
                    referenced: false,
                };
            }
        }
    }

    /// Clock scan: clear-and-skip referenced frames once, take the first
    /// frame whose bit is already clear. Bounded to two passes plus one
    /// step; unowned slots (allocations in flight) are skipped without
    /// touching their bit.
    fn pick_victim(&self) -> Option<(Frame, ThreadId, VirtAddr)> {
        let mut s = self.slots.lock();
        let count = s.slots.len();
        if count == 0 {
            return None;
        }
        let mut hand = s.hand;
        for _ in 0..2 * count + 1 {
            let index = hand;
            hand = (hand + 1) % count;
            let slot = &mut s.slots[index];
            let Some(owner) = slot.owner else {
                continue;
            };
            if slot.referenced {
                slot.referenced = false;
                continue;
            }
            let vpage = slot.vpage;
            s.hand = hand;
            return Some((Frame(index as u32), owner, vpage));
        }
        s.hand = hand;
        None
    }
}

// ============================================================================
// Allocation
// ============================================================================

/// Get a free pool frame, evicting one resident page if the pool is
/// full. Fails with [`VmError::OutOfMemory`] only when the pool and swap
/// are both exhausted. The returned frame is content-only: the caller
/// populates it, installs the hardware mapping, and then claims it.
pub(crate) fn allocate_frame(vm: &Vm, zeroed: bool) -> VmResult<Frame> {
    if let Some(frame) = vm.pool().alloc(zeroed) {
        return Ok(frame);
    }

    let _eviction = vm.frames().eviction.lock();

    // The pool may have refilled while this thread waited on the lock.
    if let Some(frame) = vm.pool().alloc(zeroed) {
        return Ok(frame);
    }

    match evict_one(vm) {
        Ok(()) => {}
        Err(VmError::SwapExhausted) => {
            log::warn!("allocation failed: pool full and swap exhausted");
            return Err(VmError::OutOfMemory);
        }
        Err(e) => return Err(e),
    }

    vm.pool().alloc(zeroed).ok_or(VmError::OutOfMemory)
}

/// Push one victim out of the pool. Runs with the eviction lock held.
fn evict_one(vm: &Vm) -> VmResult<()> {
    let frames = vm.frames();
    let Some((victim, owner, vpage)) = frames.pick_victim() else {
        // Every slot is an allocation in flight; nothing can be reclaimed.
        return Err(VmError::OutOfMemory);
    };
    let thread = vm
        .thread(owner)
        .expect("frame owner vanished under the eviction lock");

    let mut spt = thread.spt.lock();
    let entry = spt
        .find_mut(vpage)
        .expect("victim frame without a descriptor");

    match entry.state {
        PageState::Mapped { frame: Some(frame) } if frame == victim => {
            let span = entry.span.expect("mmap descriptor without a file span");
            let dirty = {
                let mut pagedir = thread.pagedir.lock();
                let dirty = pagedir.is_dirty(vpage);
                pagedir.unmap(vpage);
                dirty
            };
            entry.state = PageState::Mapped { frame: None };
            drop(spt);

            if dirty {
                // SAFETY: the eviction lock is held and the victim's
                // mapping is gone, so nothing else touches these bytes.
                let bytes = unsafe { vm.pool().frame_bytes(victim) };
                let mut filesys = vm.filesys().lock();
                filesys.write_at(span.file, span.offset, &bytes[..span.bytes]);
            }
            frames.unclaim(victim);
            vm.pool().free(victim);
            log::debug!("evicted mmap page {vpage:#x} of thread {owner:?} (dirty: {dirty})");
            Ok(())
        }

        PageState::Resident { frame } if frame == victim && entry.share.is_some() => {
            // The descriptor keeps its handle until every owner is moved
            // to FileBacked below, so a concurrent write fault still
            // routes to copy-on-write and retries instead of misfiring.
            let handle = entry.share.expect("guard checked the handle");
            drop(spt);
            // Dissolves the sharing entry and drops every owner to
            // FileBacked; the content re-derives from the file.
            share::evict_shared_frame(vm, handle, victim);
            log::debug!("evicted shared frame {victim:?}; owners fall back to file");
            Ok(())
        }

        PageState::Resident { frame } if frame == victim => {
            thread.pagedir.lock().unmap(vpage);

            // The swap lock is a leaf, so holding the SPT lock across the
            // copy keeps the state/backing pair consistent for fault
            // handlers without risking a cycle.
            let slot = {
                // SAFETY: eviction lock held, victim unmapped.
                let bytes = unsafe { vm.pool().frame_bytes(victim) };
                vm.swap().lock().swap_out(bytes)
            };
            match slot {
                Some(slot) => {
                    entry.state = PageState::Swapped { slot };
                    drop(spt);
                    frames.unclaim(victim);
                    vm.pool().free(victim);
                    log::debug!("evicted page {vpage:#x} of thread {owner:?} to {slot:?}");
                    Ok(())
                }
                None => {
                    // Undo the unmap so the victim stays usable; the
                    // failed allocation is the caller's to report.
                    let restored = thread.pagedir.lock().map(vpage, victim, entry.writable);
                    debug_assert!(restored, "remap of undisturbed victim failed");
                    Err(VmError::SwapExhausted)
                }
            }
        }

        _ => unreachable!("claimed frame without a resident descriptor"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_second_chance() {
        let table = FrameTable::new(3);
        table.claim(Frame(0), ThreadId(1), 0x1000);
        table.claim(Frame(1), ThreadId(1), 0x2000);
        table.claim(Frame(2), ThreadId(1), 0x3000);

        // All recency bits are set, so the scan clears each once and
        // returns to the first frame, now clear.
        let (victim, owner, vpage) = table.pick_victim().unwrap();
        assert_eq!(victim, Frame(0));
        assert_eq!(owner, ThreadId(1));
        assert_eq!(vpage, 0x1000);

        // The cursor persisted past frame 0; frame 1's bit is already
        // clear from the first pass.
        let (victim, _, _) = table.pick_victim().unwrap();
        assert_eq!(victim, Frame(1));
    }

    #[test]
    fn test_clock_skips_unowned() {
        let table = FrameTable::new(3);
        table.claim(Frame(1), ThreadId(1), 0x2000);
        table.claim(Frame(2), ThreadId(2), 0x3000);

        // Frame 0 is unowned and never touched; frames 1 and 2 each get
        // their second chance, then the wrap lands on frame 1 first.
        let (victim, owner, _) = table.pick_victim().unwrap();
        assert_eq!(victim, Frame(1));
        assert_eq!(owner, ThreadId(1));
    }

    #[test]
    fn test_no_owned_frames_no_victim() {
        let table = FrameTable::new(2);
        assert!(table.pick_victim().is_none());
    }

    #[test]
    fn test_release_owner() {
        let table = FrameTable::new(3);
        table.claim(Frame(0), ThreadId(1), 0x1000);
        table.claim(Frame(1), ThreadId(2), 0x2000);

        table.release_owner(ThreadId(1));
        assert_eq!(table.owner_of(Frame(0)), None);
        assert_eq!(table.owner_of(Frame(1)), Some(ThreadId(2)));
    }
}
