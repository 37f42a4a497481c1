//! Sharing Registry - Read-Only Page Sharing and Copy-on-Write
//!
//! Cross-process map from executable identity (file, offset) to one
//! shared read-only frame. Processes loading the same identity reuse the
//! frame; a write fault forces a private copy (or an in-place unshare for
//! a sole owner).
//!
//! Entries live in an arena addressed by generation-checked handles.
//! Descriptors hold handles, never pointers; dissolving an entry bumps
//! the slot generation, so a stale handle can only miss, never read
//! freed state.
//!
//! Every mutation of the registry runs under the eviction lock: sharing
//! traffic is rare (executable page loads, COW, teardown), and
//! serializing it with eviction is what lets an evictor reclaim a shared
//! frame while owners concurrently fault it in.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{VmError, VmResult};
use crate::frame;
use crate::page::{FileSpan, PageState};
use crate::thread::Thread;
use crate::types::{FileId, Frame, ThreadId, VirtAddr};
use crate::vm::Vm;

// ============================================================================
// Handles and Entries
// ============================================================================

/// Stable reference to one sharing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareHandle {
    index: u32,
    generation: u32,
}

/// One process's membership in an entry: who, and at which virtual page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ShareOwner {
    pub thread: ThreadId,
    pub vpage: VirtAddr,
}

struct ShareEntry {
    file: FileId,
    offset: usize,
    frame: Frame,
    /// The reference count is this set's length.
    owners: Vec<ShareOwner>,
}

struct ArenaSlot {
    generation: u32,
    entry: Option<ShareEntry>,
}

struct ShareArena {
    slots: Vec<ArenaSlot>,
    free: Vec<u32>,
}

/// What happened to an entry when one owner left.
enum RemoveOutcome {
    /// The set emptied; the frame is the caller's to release.
    Dissolved { frame: Frame },
    /// Owners remain; `survivor` can inherit frame-table ownership.
    Remaining { frame: Frame, survivor: ShareOwner },
    /// The handle no longer names a live entry.
    Stale,
}

// ============================================================================
// Registry
// ============================================================================

/// Global registry of shared read-only frames.
pub struct SharingRegistry {
    arena: Mutex<ShareArena>,
}

impl SharingRegistry {
    pub fn new() -> Self {
        Self {
            arena: Mutex::new(ShareArena {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Number of live entries.
    pub fn entry_count(&self) -> usize {
        self.arena
            .lock()
            .slots
            .iter()
            .filter(|s| s.entry.is_some())
            .count()
    }

    /// Frame behind a handle, if still live.
    pub fn frame_of(&self, handle: ShareHandle) -> Option<Frame> {
        let arena = self.arena.lock();
        arena.get(handle).map(|e| e.frame)
    }

    fn lookup(&self, file: FileId, offset: usize) -> Option<(ShareHandle, Frame)> {
        let arena = self.arena.lock();
        for (index, slot) in arena.slots.iter().enumerate() {
            if let Some(entry) = &slot.entry {
                if entry.file == file && entry.offset == offset {
                    return Some((
                        ShareHandle {
                            index: index as u32,
                            generation: slot.generation,
                        },
                        entry.frame,
                    ));
                }
            }
        }
        None
    }

    fn publish(&self, file: FileId, offset: usize, frame: Frame) -> ShareHandle {
        let mut arena = self.arena.lock();
        let entry = ShareEntry {
            file,
            offset,
            frame,
            owners: Vec::new(),
        };
        if let Some(index) = arena.free.pop() {
            let slot = &mut arena.slots[index as usize];
            slot.entry = Some(entry);
            ShareHandle {
                index,
                generation: slot.generation,
            }
        } else {
            arena.slots.push(ArenaSlot {
                generation: 0,
                entry: Some(entry),
            });
            ShareHandle {
                index: (arena.slots.len() - 1) as u32,
                generation: 0,
            }
        }
    }

    fn add_owner(&self, handle: ShareHandle, owner: ShareOwner) {
        let mut arena = self.arena.lock();
        if let Some(entry) = arena.get_mut(handle) {
            debug_assert!(!entry.owners.contains(&owner));
            entry.owners.push(owner);
        }
    }

    fn owner_count(&self, handle: ShareHandle) -> usize {
        let arena = self.arena.lock();
        arena.get(handle).map_or(0, |e| e.owners.len())
    }

    fn remove_owner(&self, handle: ShareHandle, thread: ThreadId) -> RemoveOutcome {
        let mut arena = self.arena.lock();
        let Some(entry) = arena.get_mut(handle) else {
            return RemoveOutcome::Stale;
        };
        entry.owners.retain(|o| o.thread != thread);
        if let Some(survivor) = entry.owners.first().copied() {
            RemoveOutcome::Remaining {
                frame: entry.frame,
                survivor,
            }
        } else {
            let frame = entry.frame;
            arena.remove(handle);
            RemoveOutcome::Dissolved { frame }
        }
    }

    /// Dissolve an entry outright, returning its owner set.
    fn remove_entry(&self, handle: ShareHandle) -> Option<(Frame, Vec<ShareOwner>)> {
        let mut arena = self.arena.lock();
        arena.remove(handle).map(|e| (e.frame, e.owners))
    }
}

impl Default for SharingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ShareArena {
    fn get(&self, handle: ShareHandle) -> Option<&ShareEntry> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn get_mut(&mut self, handle: ShareHandle) -> Option<&mut ShareEntry> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    fn remove(&mut self, handle: ShareHandle) -> Option<ShareEntry> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Some(entry)
    }
}

// ============================================================================
// Acquire
// ============================================================================

/// Resolve a read-only file-span fault through the registry: reuse the
/// published frame for this identity or publish a freshly loaded one.
/// Leaves the descriptor Resident, read-only, and linked to the entry.
pub(crate) fn acquire_read_only(
    vm: &Vm,
    thread: &Arc<Thread>,
    vpage: VirtAddr,
    span: FileSpan,
) -> VmResult<()> {
    // Load a candidate before serializing with eviction: allocation may
    // itself evict, and the file read must not happen under the lock of
    // an entry other owners already use.
    let candidate = frame::allocate_frame(vm, true)?;
    crate::fault::load_span(vm, candidate, span);

    let _eviction = vm.frames().eviction.lock();

    let (frame, handle, published) = match vm.sharing().lookup(span.file, span.offset) {
        Some((handle, frame)) => {
            // Lost the publish race (or the identity was already shared):
            // the candidate goes straight back.
            vm.pool().free(candidate);
            (frame, handle, false)
        }
        None => {
            let handle = vm.sharing().publish(span.file, span.offset, candidate);
            (candidate, handle, true)
        }
    };

    if !thread.pagedir.lock().map(vpage, frame, false) {
        if published {
            vm.sharing().remove_entry(handle);
            vm.pool().free(frame);
        }
        return Err(VmError::AllocationFailure);
    }

    vm.sharing().add_owner(
        handle,
        ShareOwner {
            thread: thread.id(),
            vpage,
        },
    );
    if published {
        vm.frames().claim(frame, thread.id(), vpage);
    } else {
        vm.frames().mark_referenced(frame);
    }

    let mut spt = thread.spt.lock();
    let entry = spt
        .find_mut(vpage)
        .expect("faulting page lost its descriptor");
    entry.state = PageState::Resident { frame };
    entry.share = Some(handle);
    Ok(())
}

// ============================================================================
// Copy-on-Write
// ============================================================================

/// Outcome of [`release_on_write`].
pub(crate) enum CowOutcome {
    Done,
    /// The entry dissolved while the copy was being prepared; the caller
    /// re-runs fault resolution.
    Retry,
}

/// Break a page out of sharing on a write fault. A sole owner keeps the
/// frame and gains write access in place; otherwise the caller gets a
/// private copy and leaves the owner set.
pub(crate) fn release_on_write(
    vm: &Vm,
    thread: &Arc<Thread>,
    vpage: VirtAddr,
) -> VmResult<CowOutcome> {
    // Pre-allocate the private copy before taking the eviction lock; a
    // sole owner hands it straight back.
    let copy = frame::allocate_frame(vm, false)?;

    let _eviction = vm.frames().eviction.lock();

    let mut spt = thread.spt.lock();
    if spt.find(vpage).is_none() {
        drop(spt);
        vm.pool().free(copy);
        return Err(VmError::InvalidAccess);
    }
    let entry = spt.find_mut(vpage).expect("descriptor present");
    let (shared_frame, handle) = match (entry.state, entry.share) {
        (PageState::Resident { frame }, Some(handle)) => (frame, handle),
        _ => {
            // Evicted to FileBacked while the copy was allocated; the
            // fault path reloads it.
            drop(spt);
            vm.pool().free(copy);
            return Ok(CowOutcome::Retry);
        }
    };

    if vm.sharing().owner_count(handle) == 1 {
        // Sole owner: dissolve the entry and write in place.
        vm.sharing().remove_entry(handle);
        entry.share = None;
        entry.writable = true;
        thread.pagedir.lock().set_writable(vpage, true);
        drop(spt);
        vm.pool().free(copy);
        log::debug!("copy-on-write unshared {vpage:#x} in place");
    } else {
        // The eviction lock keeps the source frame resident for the copy.
        vm.pool().copy_frame(shared_frame, copy);
        {
            let mut pagedir = thread.pagedir.lock();
            pagedir.unmap(vpage);
            if !pagedir.map(vpage, copy, true) {
                let restored = pagedir.map(vpage, shared_frame, false);
                debug_assert!(restored, "restore of shared mapping failed");
                drop(pagedir);
                drop(spt);
                vm.pool().free(copy);
                return Err(VmError::AllocationFailure);
            }
        }
        entry.state = PageState::Resident { frame: copy };
        entry.share = None;
        entry.writable = true;
        drop(spt);
        drop_owner(vm, handle, thread.id());
        vm.frames().claim(copy, thread.id(), vpage);
        log::debug!("copy-on-write duplicated {shared_frame:?} -> {copy:?} at {vpage:#x}");
    }
    Ok(CowOutcome::Done)
}

// ============================================================================
// Departure Paths
// ============================================================================

/// Remove one owner; dissolves an emptied entry and transfers frame-table
/// ownership when the departing thread held it. Runs under the eviction
/// lock.
pub(crate) fn drop_owner(vm: &Vm, handle: ShareHandle, thread: ThreadId) {
    match vm.sharing().remove_owner(handle, thread) {
        RemoveOutcome::Dissolved { frame } => {
            vm.frames().unclaim(frame);
            vm.pool().free(frame);
        }
        RemoveOutcome::Remaining { frame, survivor } => {
            if vm.frames().owner_of(frame) == Some(thread) {
                vm.frames().transfer(frame, survivor.thread, survivor.vpage);
            }
        }
        RemoveOutcome::Stale => {}
    }
}

/// Reclaim a shared frame for eviction: invalidate every owner's mapping,
/// drop their descriptors to FileBacked, dissolve the entry, and return
/// the frame to the pool. Runs under the eviction lock; no I/O, since
/// shared frames are never dirtied.
pub(crate) fn evict_shared_frame(vm: &Vm, handle: ShareHandle, victim: Frame) {
    let Some((frame, owners)) = vm.sharing().remove_entry(handle) else {
        return;
    };
    debug_assert_eq!(frame, victim);
    for owner in owners {
        let Some(thread) = vm.thread(owner.thread) else {
            continue;
        };
        thread.pagedir.lock().unmap(owner.vpage);
        let mut spt = thread.spt.lock();
        if let Some(entry) = spt.find_mut(owner.vpage) {
            entry.state = PageState::FileBacked;
            entry.share = None;
        }
    }
    vm.frames().unclaim(victim);
    vm.pool().free(victim);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_handles() {
        let registry = SharingRegistry::new();
        let h = registry.publish(FileId(1), 0, Frame(0));
        assert_eq!(registry.frame_of(h), Some(Frame(0)));
        assert_eq!(registry.lookup(FileId(1), 0).map(|(_, f)| f), Some(Frame(0)));
        assert!(registry.lookup(FileId(1), 4096).is_none());

        registry.remove_entry(h);
        assert_eq!(registry.frame_of(h), None, "handle is stale after removal");

        // The slot is reused under a new generation; the old handle still
        // misses.
        let h2 = registry.publish(FileId(2), 0, Frame(1));
        assert_eq!(registry.frame_of(h), None);
        assert_eq!(registry.frame_of(h2), Some(Frame(1)));
    }

    #[test]
    fn test_owner_set_is_the_count() {
        let registry = SharingRegistry::new();
        let h = registry.publish(FileId(1), 0, Frame(0));
        registry.add_owner(
            h,
            ShareOwner {
                thread: ThreadId(1),
                vpage: 0x1000,
            },
        );
        registry.add_owner(
            h,
            ShareOwner {
                thread: ThreadId(2),
                vpage: 0x5000,
            },
        );
        assert_eq!(registry.owner_count(h), 2);

        match registry.remove_owner(h, ThreadId(1)) {
            RemoveOutcome::Remaining { survivor, .. } => {
                assert_eq!(survivor.thread, ThreadId(2));
            }
            _ => panic!("expected a surviving owner"),
        }
        match registry.remove_owner(h, ThreadId(2)) {
            RemoveOutcome::Dissolved { frame } => assert_eq!(frame, Frame(0)),
            _ => panic!("expected dissolution"),
        }
        assert_eq!(registry.entry_count(), 0);
    }
}
