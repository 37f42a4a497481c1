//! VM Context - Assembly and User-Facing Operations
//!
//! The [`Vm`] struct is the one context object for the whole subsystem:
//! it owns the pool, the frame table, the sharing registry, both
//! collaborator devices, and the thread registry, and is constructed once
//! and passed by reference to every operation. There are no ambient
//! globals.
//!
//! The methods here are the surface the trap handler and syscall layer
//! call into: `page_fault`, `mmap`/`munmap`, segment registration, fd
//! plumbing for mmap, and `process_teardown`.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{VmError, VmResult};
use crate::fault;
use crate::filesys::FileSystem;
use crate::frame::FrameTable;
use crate::mmap;
use crate::page::{FileSpan, PageEntry, PageState};
use crate::pagedir::PageDir;
use crate::pool::PagePool;
use crate::share::{self, SharingRegistry};
use crate::swap::SwapDevice;
use crate::thread::Thread;
use crate::types::{
    is_page_aligned, round_page, FileId, MapId, ThreadId, VirtAddr, PAGE_SIZE, USER_TOP,
};

// ============================================================================
// Context
// ============================================================================

/// The virtual-memory subsystem.
pub struct Vm {
    pool: PagePool,
    frames: FrameTable,
    sharing: SharingRegistry,
    swap: Mutex<Box<dyn SwapDevice>>,
    filesys: Mutex<Box<dyn FileSystem>>,
    threads: Mutex<BTreeMap<ThreadId, Arc<Thread>>>,
}

impl Vm {
    /// Assemble the subsystem over a pool and the two collaborator
    /// devices.
    pub fn new(pool: PagePool, swap: Box<dyn SwapDevice>, filesys: Box<dyn FileSystem>) -> Self {
        let frames = FrameTable::new(pool.page_count());
        Self {
            pool,
            frames,
            sharing: SharingRegistry::new(),
            swap: Mutex::new(swap),
            filesys: Mutex::new(filesys),
            threads: Mutex::new(BTreeMap::new()),
        }
    }

    /// The physical pool.
    pub fn pool(&self) -> &PagePool {
        &self.pool
    }

    /// The filesystem, behind its single global lock.
    pub fn filesys(&self) -> &Mutex<Box<dyn FileSystem>> {
        &self.filesys
    }

    /// The swap device.
    pub fn swap(&self) -> &Mutex<Box<dyn SwapDevice>> {
        &self.swap
    }

    pub(crate) fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub(crate) fn sharing(&self) -> &SharingRegistry {
        &self.sharing
    }

    /// Registry entry for a live thread.
    pub fn thread(&self, id: ThreadId) -> Option<Arc<Thread>> {
        self.threads.lock().get(&id).cloned()
    }

    // ========================================================================
    // Thread Registry
    // ========================================================================

    /// Register a process's VM state under `id`.
    pub fn spawn_thread(
        &self,
        id: ThreadId,
        name: &str,
        pagedir: Box<dyn PageDir>,
    ) -> Arc<Thread> {
        let thread = Arc::new(Thread::new(id, name, pagedir));
        let prior = self.threads.lock().insert(id, Arc::clone(&thread));
        debug_assert!(prior.is_none(), "thread id reused while live");
        thread
    }

    /// Record the stack pointer a thread trapped with; the stack growth
    /// heuristic reads it on the next fault.
    pub fn set_user_stack_pointer(&self, id: ThreadId, sp: u64) {
        if let Some(thread) = self.thread(id) {
            thread.set_user_sp(sp);
        }
    }

    // ========================================================================
    // Segments
    // ========================================================================

    /// Record one executable segment: `read_bytes` from `offset` in
    /// `file`, then `zero_bytes` of zero fill, page by page from `base`.
    /// Content loads lazily on first fault; read-only pages are shared
    /// across processes running the same binary.
    pub fn register_segment(
        &self,
        id: ThreadId,
        base: VirtAddr,
        file: FileId,
        offset: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> VmResult<()> {
        let thread = self.thread(id).ok_or(VmError::InvalidMapping)?;
        let total = read_bytes + zero_bytes;
        if total == 0 || !is_page_aligned(base) {
            return Err(VmError::InvalidMapping);
        }
        let end = base
            .checked_add(round_page(total as u64))
            .filter(|&end| end <= USER_TOP)
            .ok_or(VmError::InvalidMapping)?;

        let mut spt = thread.spt.lock();
        let mut page = base;
        while page < end {
            if spt.contains(page) {
                return Err(VmError::InvalidMapping);
            }
            page += PAGE_SIZE as u64;
        }

        let mut remaining = read_bytes;
        let mut page = base;
        let mut page_offset = offset;
        while page < end {
            let bytes = remaining.min(PAGE_SIZE);
            let span = (bytes > 0).then_some(FileSpan {
                file,
                offset: page_offset,
                bytes,
            });
            spt.insert(page, PageEntry::unloaded(span, writable));
            remaining -= bytes;
            page_offset += PAGE_SIZE;
            page += PAGE_SIZE as u64;
        }
        Ok(())
    }

    // ========================================================================
    // Faults
    // ========================================================================

    /// Resolve a page fault for thread `id` at `addr`. An
    /// `InvalidAccess` return means the caller should terminate the
    /// faulting process (and only it); `OutOfMemory` is kernel-fatal.
    pub fn page_fault(&self, id: ThreadId, addr: VirtAddr, is_write: bool) -> VmResult<()> {
        let Some(thread) = self.thread(id) else {
            return Err(VmError::InvalidAccess);
        };
        let result = fault::handle_fault(self, &thread, addr, is_write);
        if result == Err(VmError::InvalidAccess) {
            log::warn!(
                "{}: invalid {} access at {addr:#x}",
                thread.name(),
                if is_write { "write" } else { "read" },
            );
        }
        result
    }

    // ========================================================================
    // Memory-Mapped Files
    // ========================================================================

    /// Map the file behind `fd` at `addr`.
    pub fn mmap(&self, id: ThreadId, fd: usize, addr: VirtAddr) -> VmResult<MapId> {
        let thread = self.thread(id).ok_or(VmError::InvalidMapping)?;
        mmap::mmap(self, &thread, fd, addr)
    }

    /// Unmap a mapping, writing dirty pages back to the file. Unknown
    /// ids are ignored.
    pub fn munmap(&self, id: ThreadId, map_id: MapId) {
        if let Some(thread) = self.thread(id) {
            mmap::munmap(self, &thread, map_id);
        }
    }

    // ========================================================================
    // File Descriptors
    // ========================================================================

    /// Give a process an fd for an open file object.
    pub fn open_fd(&self, id: ThreadId, file: FileId) -> VmResult<usize> {
        let thread = self.thread(id).ok_or(VmError::AllocationFailure)?;
        let fd = thread.fds.lock().install(file);
        fd.ok_or(VmError::AllocationFailure)
    }

    /// Close an fd. Returns `false` without closing when a live mapping
    /// of this process still references the file; the close is deferred
    /// to whoever retries after the unmap.
    pub fn close_fd(&self, id: ThreadId, fd: usize) -> bool {
        let Some(thread) = self.thread(id) else {
            return false;
        };
        let Some(file) = thread.fds.lock().get(fd) else {
            return false;
        };
        if thread.mmaps.lock().references_file(file) {
            log::debug!("{}: close of fd {fd} deferred, file is mapped", thread.name());
            return false;
        }
        thread.fds.lock().clear(fd);
        true
    }

    /// Whether any live mapping of this process references `file`; the
    /// external close dispatch consults this.
    pub fn file_is_mapped(&self, id: ThreadId, file: FileId) -> bool {
        self.thread(id)
            .is_some_and(|t| t.mmaps.lock().references_file(file))
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Free everything a process holds: unmap every mapping (with
    /// write-back), release every frame and swap slot, leave shared
    /// entries to their surviving owners, and drop the page directory.
    pub fn process_teardown(&self, id: ThreadId) {
        let Some(thread) = self.thread(id) else {
            return;
        };

        // Mappings first: munmap serializes with eviction internally and
        // handles the dirty write-back.
        let map_ids: Vec<MapId> = thread.mmaps.lock().ids();
        for map_id in map_ids {
            mmap::munmap(self, &thread, map_id);
        }

        // The rest of the SPT goes away under the eviction lock so no
        // evictor can be working on this thread's frames.
        {
            let _eviction = self.frames.eviction.lock();
            let drained = thread.spt.lock().drain();
            for (vpage, entry) in drained {
                match entry.state {
                    PageState::Resident { frame } => {
                        thread.pagedir.lock().unmap(vpage);
                        if let Some(handle) = entry.share {
                            share::drop_owner(self, handle, id);
                        } else {
                            self.frames.unclaim(frame);
                            self.pool.free(frame);
                        }
                    }
                    PageState::Swapped { slot } => {
                        self.swap.lock().free_slot(slot);
                    }
                    PageState::Mapped { frame: Some(frame) } => {
                        // Mappings were unmapped above; a straggler loses
                        // its write-back but not its frame.
                        thread.pagedir.lock().unmap(vpage);
                        self.frames.unclaim(frame);
                        self.pool.free(frame);
                    }
                    PageState::Unloaded
                    | PageState::FileBacked
                    | PageState::Mapped { frame: None } => {}
                }
            }
            self.frames.release_owner(id);
        }

        self.threads.lock().remove(&id);
        log::debug!("{}: vm state torn down", thread.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesys::MemFs;
    use crate::pagedir::SoftPageDir;
    use crate::swap::MemSwap;
    use crate::types::{Frame, STACK_MAX};
    use alloc::vec;

    const CODE_BASE: VirtAddr = 0x0804_8000;
    const MAP_BASE: VirtAddr = 0x1000_0000;

    fn build_vm(pool_pages: usize, swap_slots: usize, files: &[&[u8]]) -> (Vm, Vec<FileId>) {
        let mut fs = MemFs::new();
        let ids = files.iter().map(|content| fs.create(content)).collect();
        let vm = Vm::new(
            PagePool::with_pages(pool_pages),
            Box::new(MemSwap::new(swap_slots)),
            Box::new(fs),
        );
        (vm, ids)
    }

    fn spawn(vm: &Vm, id: u64) -> Arc<Thread> {
        let thread = vm.spawn_thread(ThreadId(id), "proc", Box::new(SoftPageDir::new()));
        // Park the stack pointer at the region floor so tests can fault
        // stack pages anywhere below USER_TOP.
        thread.set_user_sp(USER_TOP - STACK_MAX);
        thread
    }

    fn frame_at(thread: &Thread, addr: VirtAddr) -> Option<Frame> {
        thread.pagedir.lock().lookup(addr)
    }

    fn read_page(vm: &Vm, thread: &Thread, addr: VirtAddr, len: usize) -> Vec<u8> {
        let frame = frame_at(thread, addr).expect("page not mapped");
        let mut buf = vec![0u8; len];
        vm.pool().copy_from_frame(frame, 0, &mut buf);
        buf
    }

    /// Simulate a user store: bytes land in the frame, hardware sets the
    /// dirty bit.
    fn write_page(vm: &Vm, thread: &Thread, addr: VirtAddr, bytes: &[u8]) {
        let frame = frame_at(thread, addr).expect("page not mapped");
        vm.pool().copy_into_frame(frame, 0, bytes);
        thread.pagedir.lock().set_dirty(addr, true);
    }

    fn state_of(thread: &Thread, addr: VirtAddr) -> PageState {
        thread.spt.lock().find(addr).expect("no descriptor").state
    }

    #[test]
    fn test_stack_growth_bounds() {
        let (vm, _) = build_vm(4, 4, &[]);
        let thread = spawn(&vm, 1);
        let sp = USER_TOP - 64;
        vm.set_user_stack_pointer(ThreadId(1), sp);

        // Just below the stack pointer: a push.
        assert!(vm.page_fault(ThreadId(1), sp - 16, true).is_ok());
        assert_eq!(read_page(&vm, &thread, (sp - 16) & !0xFFF, 16), vec![0; 16]);

        // Far below the stack pointer: no descriptor appears.
        let before = thread.spt.lock().len();
        assert_eq!(
            vm.page_fault(ThreadId(1), sp - 40 * PAGE_SIZE as u64, false),
            Err(VmError::InvalidAccess)
        );
        assert_eq!(thread.spt.lock().len(), before);

        // Outside the stack region entirely.
        assert_eq!(
            vm.page_fault(ThreadId(1), USER_TOP - STACK_MAX - PAGE_SIZE as u64, false),
            Err(VmError::InvalidAccess)
        );
        // Kernel addresses never fault in.
        assert_eq!(
            vm.page_fault(ThreadId(1), USER_TOP + 8, false),
            Err(VmError::InvalidAccess)
        );
    }

    #[test]
    fn test_segment_load_reads_file_and_zero_tail() {
        let mut content = vec![0u8; 100];
        content.copy_from_slice(&[7u8; 100]);
        let (vm, files) = build_vm(4, 4, &[&content]);
        spawn(&vm, 1);

        vm.register_segment(ThreadId(1), CODE_BASE, files[0], 0, 100, PAGE_SIZE - 100, false)
            .unwrap();
        vm.page_fault(ThreadId(1), CODE_BASE + 4, false).unwrap();

        let thread = vm.thread(ThreadId(1)).unwrap();
        let page = read_page(&vm, &thread, CODE_BASE, PAGE_SIZE);
        assert_eq!(&page[..100], &[7u8; 100][..]);
        assert!(page[100..].iter().all(|&b| b == 0));

        // Read-only executable pages go through the sharing registry.
        assert_eq!(vm.sharing().entry_count(), 1);
        assert!(!thread.pagedir.lock().is_writable(CODE_BASE));
    }

    #[test]
    fn test_swap_round_trip_single_frame_pool() {
        let (vm, _) = build_vm(1, 4, &[]);
        let thread = spawn(&vm, 1);
        let a = USER_TOP - PAGE_SIZE as u64;
        let b = USER_TOP - 2 * PAGE_SIZE as u64;

        vm.page_fault(ThreadId(1), a, true).unwrap();
        write_page(&vm, &thread, a, b"written before eviction");

        // Faulting B forces A out to swap.
        vm.page_fault(ThreadId(1), b, true).unwrap();
        assert!(matches!(state_of(&thread, a), PageState::Swapped { .. }));
        assert_eq!(frame_at(&thread, a), None);

        // Faulting A back round-trips the content (and evicts B).
        vm.page_fault(ThreadId(1), a, false).unwrap();
        assert_eq!(
            read_page(&vm, &thread, a, 23),
            b"written before eviction".to_vec()
        );
    }

    #[test]
    fn test_eviction_liveness_beyond_pool() {
        let (vm, _) = build_vm(3, 16, &[]);
        let thread = spawn(&vm, 1);
        let base = USER_TOP - 8 * PAGE_SIZE as u64;

        for i in 0..8u8 {
            let addr = base + i as u64 * PAGE_SIZE as u64;
            vm.page_fault(ThreadId(1), addr, true).unwrap();
            write_page(&vm, &thread, addr, &[i + 1; 8]);
        }
        // Every page comes back intact even though only 3 fit.
        for i in 0..8u8 {
            let addr = base + i as u64 * PAGE_SIZE as u64;
            vm.page_fault(ThreadId(1), addr, false).unwrap();
            assert_eq!(read_page(&vm, &thread, addr, 8), vec![i + 1; 8]);
        }
    }

    #[test]
    fn test_clock_evicts_first_unreferenced() {
        let (vm, _) = build_vm(3, 8, &[]);
        let thread = spawn(&vm, 1);
        let a = USER_TOP - PAGE_SIZE as u64;
        let b = USER_TOP - 2 * PAGE_SIZE as u64;
        let c = USER_TOP - 3 * PAGE_SIZE as u64;
        let d = USER_TOP - 4 * PAGE_SIZE as u64;

        vm.page_fault(ThreadId(1), a, true).unwrap();
        vm.page_fault(ThreadId(1), b, true).unwrap();
        vm.page_fault(ThreadId(1), c, true).unwrap();

        // Pool is full; every frame has its recency bit set. The scan
        // gives each a second chance and takes the first frame again.
        vm.page_fault(ThreadId(1), d, true).unwrap();

        assert!(matches!(state_of(&thread, a), PageState::Swapped { .. }));
        assert!(matches!(state_of(&thread, b), PageState::Resident { .. }));
        assert!(matches!(state_of(&thread, c), PageState::Resident { .. }));
        assert!(matches!(state_of(&thread, d), PageState::Resident { .. }));
    }

    #[test]
    fn test_sharing_and_cow_isolation() {
        let exec = vec![0x5Au8; 200];
        let (vm, files) = build_vm(8, 8, &[&exec]);
        spawn(&vm, 1);
        spawn(&vm, 2);
        for id in [1u64, 2] {
            vm.register_segment(ThreadId(id), CODE_BASE, files[0], 0, 200, 0, false)
                .unwrap();
            vm.page_fault(ThreadId(id), CODE_BASE, false).unwrap();
        }
        let t1 = vm.thread(ThreadId(1)).unwrap();
        let t2 = vm.thread(ThreadId(2)).unwrap();

        // One physical frame serves both processes, read-only.
        let shared = frame_at(&t1, CODE_BASE).unwrap();
        assert_eq!(frame_at(&t2, CODE_BASE), Some(shared));
        assert_eq!(vm.sharing().entry_count(), 1);
        assert!(!t1.pagedir.lock().is_writable(CODE_BASE));

        // A write by process 1 duplicates the frame; process 2 keeps its
        // view.
        vm.page_fault(ThreadId(1), CODE_BASE, true).unwrap();
        let private = frame_at(&t1, CODE_BASE).unwrap();
        assert_ne!(private, shared);
        assert_eq!(frame_at(&t2, CODE_BASE), Some(shared));
        assert_eq!(read_page(&vm, &t1, CODE_BASE, 200), exec);
        assert_eq!(read_page(&vm, &t2, CODE_BASE, 200), exec);
        assert!(t1.pagedir.lock().is_writable(CODE_BASE));
        assert_eq!(vm.sharing().entry_count(), 1);

        write_page(&vm, &t1, CODE_BASE, b"private now");
        assert_eq!(read_page(&vm, &t2, CODE_BASE, 200), exec);

        // Process 2 is now the sole owner; its write unshares in place.
        vm.page_fault(ThreadId(2), CODE_BASE, true).unwrap();
        assert_eq!(frame_at(&t2, CODE_BASE), Some(shared));
        assert!(t2.pagedir.lock().is_writable(CODE_BASE));
        assert_eq!(vm.sharing().entry_count(), 0);
    }

    #[test]
    fn test_shared_frame_eviction_falls_back_to_file() {
        let exec = vec![0x33u8; PAGE_SIZE];
        let (vm, files) = build_vm(2, 8, &[&exec]);
        spawn(&vm, 1);
        spawn(&vm, 2);
        for id in [1u64, 2] {
            vm.register_segment(ThreadId(id), CODE_BASE, files[0], 0, PAGE_SIZE, 0, false)
                .unwrap();
            vm.page_fault(ThreadId(id), CODE_BASE, false).unwrap();
        }
        let t1 = vm.thread(ThreadId(1)).unwrap();
        let t2 = vm.thread(ThreadId(2)).unwrap();

        // Fill the pool; the next fault evicts the shared frame first.
        vm.page_fault(ThreadId(1), USER_TOP - PAGE_SIZE as u64, true)
            .unwrap();
        vm.page_fault(ThreadId(1), USER_TOP - 2 * PAGE_SIZE as u64, true)
            .unwrap();

        assert_eq!(state_of(&t1, CODE_BASE), PageState::FileBacked);
        assert_eq!(state_of(&t2, CODE_BASE), PageState::FileBacked);
        assert_eq!(frame_at(&t1, CODE_BASE), None);
        assert_eq!(frame_at(&t2, CODE_BASE), None);
        assert_eq!(vm.sharing().entry_count(), 0);

        // Refaulting re-derives from the file and re-shares.
        vm.page_fault(ThreadId(2), CODE_BASE, false).unwrap();
        assert_eq!(read_page(&vm, &t2, CODE_BASE, 16), vec![0x33u8; 16]);
        assert_eq!(vm.sharing().entry_count(), 1);
    }

    #[test]
    fn test_mmap_rejects_bad_requests() {
        let (vm, files) = build_vm(4, 4, &[b"0123456789", b""]);
        let thread = spawn(&vm, 1);
        let fd = vm.open_fd(ThreadId(1), files[0]).unwrap();
        let empty_fd = vm.open_fd(ThreadId(1), files[1]).unwrap();

        let before = thread.spt.lock().len();
        let t = ThreadId(1);
        assert_eq!(vm.mmap(t, fd, 0), Err(VmError::InvalidMapping));
        assert_eq!(vm.mmap(t, fd, MAP_BASE + 0x10), Err(VmError::InvalidMapping));
        assert_eq!(vm.mmap(t, 0, MAP_BASE), Err(VmError::InvalidMapping));
        assert_eq!(vm.mmap(t, 1, MAP_BASE), Err(VmError::InvalidMapping));
        assert_eq!(vm.mmap(t, empty_fd, MAP_BASE), Err(VmError::InvalidMapping));
        assert_eq!(vm.mmap(t, 17, MAP_BASE), Err(VmError::InvalidMapping));

        // Overlap with an existing descriptor.
        vm.register_segment(t, MAP_BASE, files[0], 0, 10, 0, true).unwrap();
        assert_eq!(vm.mmap(t, fd, MAP_BASE), Err(VmError::InvalidMapping));

        // Rejections left the SPT untouched (one segment page aside).
        assert_eq!(thread.spt.lock().len(), before + 1);
    }

    #[test]
    fn test_munmap_writes_back_only_dirty_pages() {
        let mut content = vec![b'.'; PAGE_SIZE + 904];
        content[PAGE_SIZE] = b'#';
        let (vm, files) = build_vm(4, 4, &[&content]);
        let thread = spawn(&vm, 1);
        let fd = vm.open_fd(ThreadId(1), files[0]).unwrap();
        let id = vm.mmap(ThreadId(1), fd, MAP_BASE).unwrap();

        // Two pages, faulted in; only the first is written.
        vm.page_fault(ThreadId(1), MAP_BASE, true).unwrap();
        vm.page_fault(ThreadId(1), MAP_BASE + PAGE_SIZE as u64, false)
            .unwrap();
        write_page(&vm, &thread, MAP_BASE, b"MMAP!");

        // While mapped, the close is deferred.
        assert!(vm.file_is_mapped(ThreadId(1), files[0]));
        assert!(!vm.close_fd(ThreadId(1), fd));

        vm.munmap(ThreadId(1), id);

        let mut head = [0u8; 5];
        let mut tail = [0u8; 4];
        vm.filesys().lock().read_at(files[0], 0, &mut head);
        vm.filesys().lock().read_at(files[0], PAGE_SIZE, &mut tail);
        assert_eq!(&head, b"MMAP!");
        assert_eq!(&tail, b"#...", "clean page stayed untouched");

        // Descriptors are gone and the close now goes through.
        assert!(thread.spt.lock().is_empty());
        assert!(vm.close_fd(ThreadId(1), fd));
    }

    #[test]
    fn test_mmap_page_evicts_to_file_and_returns() {
        let content = vec![b'm'; PAGE_SIZE];
        let (vm, files) = build_vm(1, 4, &[&content]);
        let thread = spawn(&vm, 1);
        let fd = vm.open_fd(ThreadId(1), files[0]).unwrap();
        vm.mmap(ThreadId(1), fd, MAP_BASE).unwrap();

        vm.page_fault(ThreadId(1), MAP_BASE, true).unwrap();
        write_page(&vm, &thread, MAP_BASE, b"dirty mmap page");

        // The next fault evicts the mmap page: write-back, not swap.
        vm.page_fault(ThreadId(1), USER_TOP - PAGE_SIZE as u64, true)
            .unwrap();
        assert_eq!(state_of(&thread, MAP_BASE), PageState::Mapped { frame: None });
        let mut buf = [0u8; 15];
        vm.filesys().lock().read_at(files[0], 0, &mut buf);
        assert_eq!(&buf, b"dirty mmap page");

        // Faulting it back re-reads the file, evicting the stack page.
        vm.page_fault(ThreadId(1), MAP_BASE, false).unwrap();
        assert_eq!(read_page(&vm, &thread, MAP_BASE, 15), b"dirty mmap page");
    }

    #[test]
    fn test_out_of_memory_when_pool_and_swap_exhausted() {
        let (vm, _) = build_vm(1, 0, &[]);
        let thread = spawn(&vm, 1);
        let a = USER_TOP - PAGE_SIZE as u64;
        let b = USER_TOP - 2 * PAGE_SIZE as u64;

        vm.page_fault(ThreadId(1), a, true).unwrap();
        assert_eq!(vm.page_fault(ThreadId(1), b, true), Err(VmError::OutOfMemory));

        // The failed eviction left the victim usable.
        assert!(frame_at(&thread, a).is_some());
        assert!(matches!(state_of(&thread, a), PageState::Resident { .. }));
    }

    #[test]
    fn test_teardown_releases_everything() {
        let (vm, _) = build_vm(1, 4, &[]);
        spawn(&vm, 1);
        let a = USER_TOP - PAGE_SIZE as u64;
        let b = USER_TOP - 2 * PAGE_SIZE as u64;

        vm.page_fault(ThreadId(1), a, true).unwrap();
        vm.page_fault(ThreadId(1), b, true).unwrap(); // a -> swap
        assert_eq!(vm.pool().free_pages(), 0);
        assert_eq!(vm.swap().lock().free_slots(), 3);

        vm.process_teardown(ThreadId(1));
        assert_eq!(vm.pool().free_pages(), 1);
        assert_eq!(vm.swap().lock().free_slots(), 4);
        assert!(vm.thread(ThreadId(1)).is_none());
    }

    #[test]
    fn test_teardown_hands_shared_frame_to_survivor() {
        let exec = vec![0x77u8; 64];
        let (vm, files) = build_vm(4, 4, &[&exec]);
        spawn(&vm, 1);
        spawn(&vm, 2);
        for id in [1u64, 2] {
            vm.register_segment(ThreadId(id), CODE_BASE, files[0], 0, 64, 0, false)
                .unwrap();
            vm.page_fault(ThreadId(id), CODE_BASE, false).unwrap();
        }
        let t2 = vm.thread(ThreadId(2)).unwrap();
        let shared = frame_at(&t2, CODE_BASE).unwrap();
        assert_eq!(vm.frames().owner_of(shared), Some(ThreadId(1)));

        vm.process_teardown(ThreadId(1));

        // The entry lives on under the survivor, which now owns the slot.
        assert_eq!(vm.sharing().entry_count(), 1);
        assert_eq!(vm.frames().owner_of(shared), Some(ThreadId(2)));
        assert_eq!(read_page(&vm, &t2, CODE_BASE, 64), exec);

        vm.process_teardown(ThreadId(2));
        assert_eq!(vm.sharing().entry_count(), 0);
        assert_eq!(vm.pool().free_pages(), 4);
    }

    /// Page directory that accepts a limited number of mappings, the way
    /// a real table runs out of page-table pages.
    struct CrampedPageDir {
        inner: SoftPageDir,
        maps_left: usize,
    }

    impl PageDir for CrampedPageDir {
        fn map(&mut self, vpage: VirtAddr, frame: Frame, writable: bool) -> bool {
            if self.maps_left == 0 {
                return false;
            }
            self.maps_left -= 1;
            self.inner.map(vpage, frame, writable)
        }
        fn unmap(&mut self, vpage: VirtAddr) {
            self.inner.unmap(vpage);
        }
        fn lookup(&self, vpage: VirtAddr) -> Option<Frame> {
            self.inner.lookup(vpage)
        }
        fn is_writable(&self, vpage: VirtAddr) -> bool {
            self.inner.is_writable(vpage)
        }
        fn set_writable(&mut self, vpage: VirtAddr, writable: bool) {
            self.inner.set_writable(vpage, writable);
        }
        fn is_dirty(&self, vpage: VirtAddr) -> bool {
            self.inner.is_dirty(vpage)
        }
        fn set_dirty(&mut self, vpage: VirtAddr, dirty: bool) {
            self.inner.set_dirty(vpage, dirty);
        }
        fn is_accessed(&self, vpage: VirtAddr) -> bool {
            self.inner.is_accessed(vpage)
        }
        fn set_accessed(&mut self, vpage: VirtAddr, accessed: bool) {
            self.inner.set_accessed(vpage, accessed);
        }
    }

    #[test]
    fn test_allocation_failure_unwinds_frame() {
        let (vm, _) = build_vm(2, 2, &[]);
        let thread = vm.spawn_thread(
            ThreadId(1),
            "cramped",
            Box::new(CrampedPageDir {
                inner: SoftPageDir::new(),
                maps_left: 0,
            }),
        );
        thread.set_user_sp(USER_TOP - 64);

        let free_before = vm.pool().free_pages();
        assert_eq!(
            vm.page_fault(ThreadId(1), USER_TOP - 128, true),
            Err(VmError::AllocationFailure)
        );
        // The frame went back and the process survives.
        assert_eq!(vm.pool().free_pages(), free_before);
        assert!(vm.thread(ThreadId(1)).is_some());
        assert_eq!(state_of(&thread, USER_TOP - PAGE_SIZE as u64), PageState::Unloaded);
    }

    #[test]
    fn test_fd_table_exhaustion_reports_allocation_failure() {
        let (vm, files) = build_vm(2, 2, &[b"x"]);
        spawn(&vm, 1);
        for _ in 0..crate::thread::MAX_OPEN_FILES - 2 {
            vm.open_fd(ThreadId(1), files[0]).unwrap();
        }
        assert_eq!(
            vm.open_fd(ThreadId(1), files[0]),
            Err(VmError::AllocationFailure)
        );
    }
}
