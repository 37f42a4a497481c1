//! Memory-Mapped Files
//!
//! Per-process table of file mappings. Mapping a file creates one
//! `Mapped` descriptor per page eagerly; content loads on fault, and
//! dirty pages are written back to the file on eviction and unmap.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{VmError, VmResult};
use crate::page::{FileSpan, PageEntry, PageState};
use crate::thread::{Thread, FD_CONSOLE_IN, FD_CONSOLE_OUT};
use crate::types::{is_page_aligned, round_page, FileId, MapId, VirtAddr, PAGE_SIZE, USER_TOP};
use crate::vm::Vm;

// ============================================================================
// Table
// ============================================================================

/// One active mapping.
#[derive(Debug, Clone, Copy)]
pub struct MmapRegion {
    pub file: FileId,
    pub base: VirtAddr,
    pub length: usize,
}

/// Per-process mapping table; ids are monotonic and never reused.
pub struct MmapTable {
    regions: BTreeMap<MapId, MmapRegion>,
    next_id: u32,
}

impl MmapTable {
    pub fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn insert(&mut self, region: MmapRegion) -> MapId {
        let id = MapId(self.next_id);
        self.next_id += 1;
        self.regions.insert(id, region);
        id
    }

    fn remove(&mut self, id: MapId) -> Option<MmapRegion> {
        self.regions.remove(&id)
    }

    pub fn get(&self, id: MapId) -> Option<&MmapRegion> {
        self.regions.get(&id)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Ids of every live mapping; teardown unmaps them one by one.
    pub fn ids(&self) -> Vec<MapId> {
        self.regions.keys().copied().collect()
    }

    /// Whether any live mapping references `file`; close defers on this.
    pub fn references_file(&self, file: FileId) -> bool {
        self.regions.values().any(|r| r.file == file)
    }
}

impl Default for MmapTable {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Map
// ============================================================================

/// Map the file behind `fd` at `addr`. Fails with `InvalidMapping` on a
/// null or misaligned address, a console or empty fd, an empty file, or
/// overlap with any existing descriptor; nothing is inserted in any
/// rejected case.
pub(crate) fn mmap(vm: &Vm, thread: &Arc<Thread>, fd: usize, addr: VirtAddr) -> VmResult<MapId> {
    if addr == 0 || !is_page_aligned(addr) {
        return Err(VmError::InvalidMapping);
    }
    if fd == FD_CONSOLE_IN || fd == FD_CONSOLE_OUT {
        return Err(VmError::InvalidMapping);
    }
    let Some(file) = thread.fds.lock().get(fd) else {
        return Err(VmError::InvalidMapping);
    };
    let length = vm.filesys().lock().length(file);
    if length == 0 {
        return Err(VmError::InvalidMapping);
    }
    let end = addr
        .checked_add(round_page(length as u64))
        .filter(|&end| end <= USER_TOP)
        .ok_or(VmError::InvalidMapping)?;

    // One SPT critical section covers the overlap check and the inserts,
    // so a rejected request leaves no trace.
    let mut spt = thread.spt.lock();
    let mut page = addr;
    while page < end {
        if spt.contains(page) {
            return Err(VmError::InvalidMapping);
        }
        page += PAGE_SIZE as u64;
    }

    let mut offset = 0;
    let mut page = addr;
    while page < end {
        let bytes = (length - offset).min(PAGE_SIZE);
        spt.insert(
            page,
            PageEntry::mapped(FileSpan {
                file,
                offset,
                bytes,
            }),
        );
        offset += PAGE_SIZE;
        page += PAGE_SIZE as u64;
    }
    drop(spt);

    let id = thread.mmaps.lock().insert(MmapRegion {
        file,
        base: addr,
        length,
    });
    log::debug!(
        "{}: mapped {file:?} at {addr:#x} ({length} bytes, id {id:?})",
        thread.name()
    );
    Ok(id)
}

// ============================================================================
// Unmap
// ============================================================================

/// Tear down one mapping: write dirty resident pages back to the file,
/// release their frames, and remove every descriptor. Unknown ids are
/// ignored.
pub(crate) fn munmap(vm: &Vm, thread: &Arc<Thread>, id: MapId) {
    let Some(region) = thread.mmaps.lock().remove(id) else {
        return;
    };

    // Frames are being freed; serialize with eviction so a chosen victim
    // cannot disappear mid-evict.
    let _eviction = vm.frames().eviction.lock();

    let end = region.base + round_page(region.length as u64);
    let mut page = region.base;
    while page < end {
        let entry = thread.spt.lock().remove(page);
        if let Some(entry) = entry {
            release_mapped_page(vm, thread, page, &entry);
        }
        page += PAGE_SIZE as u64;
    }
    log::debug!("{}: unmapped id {id:?}", thread.name());
}

/// Release one mapped page: write-back if resident and dirty, then free
/// the frame. Runs under the eviction lock.
fn release_mapped_page(vm: &Vm, thread: &Arc<Thread>, page: VirtAddr, entry: &PageEntry) {
    let PageState::Mapped { frame: Some(frame) } = entry.state else {
        return;
    };
    let dirty = {
        let mut pagedir = thread.pagedir.lock();
        let dirty = pagedir.is_dirty(page);
        pagedir.unmap(page);
        dirty
    };
    if dirty {
        let span = entry.span.expect("mmap descriptor without a file span");
        // SAFETY: the eviction lock is held and the mapping is gone, so
        // nothing else touches these bytes.
        let bytes = unsafe { vm.pool().frame_bytes(frame) };
        vm.filesys()
            .lock()
            .write_at(span.file, span.offset, &bytes[..span.bytes]);
    }
    vm.frames().unclaim(frame);
    vm.pool().free(frame);
}
