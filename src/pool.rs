//! User Pool - Physical Page Frames
//!
//! A fixed region of page-sized frames with a free bitmap. The pool hands
//! out zeroable pages and knows nothing about who maps them; ownership and
//! eviction live in the frame table.
//!
//! The region either wraps memory handed over by the platform
//! ([`PagePool::from_raw`]) or is carved out of the heap
//! ([`PagePool::with_pages`]), which is how the tests and hosted embedders
//! run the whole VM without hardware.

use alloc::vec;
use alloc::vec::Vec;
use core::alloc::Layout;
use spin::Mutex;

use crate::types::{Frame, PAGE_SIZE};

// ============================================================================
// Pool
// ============================================================================

/// The user pool: `page_count` contiguous page frames plus a free bitmap.
pub struct PagePool {
    base: *mut u8,
    page_count: usize,
    owned: bool,
    state: Mutex<PoolState>,
}

struct PoolState {
    /// One bit per frame; set = in use.
    used: Vec<u64>,
    free_count: usize,
}

// SAFETY: the raw base pointer is only dereferenced through methods that
// take `&self`, and concurrent access to one frame's bytes is excluded by
// the frame-ownership discipline in the frame table.
unsafe impl Send for PagePool {}
unsafe impl Sync for PagePool {}

impl PagePool {
    /// Wrap a platform-provided pool region.
    ///
    /// # Safety
    ///
    /// `base` must point to `page_count * PAGE_SIZE` bytes of page-aligned
    /// memory that outlives the pool and is used by nothing else.
    pub unsafe fn from_raw(base: *mut u8, page_count: usize) -> Self {
        Self {
            base,
            page_count,
            owned: false,
            state: Mutex::new(PoolState::new(page_count)),
        }
    }

    /// Carve a pool out of the heap; used by hosted embedders and tests.
    pub fn with_pages(page_count: usize) -> Self {
        let layout = Self::layout(page_count);
        // SAFETY: layout is non-zero and page-aligned.
        let base = unsafe { alloc::alloc::alloc_zeroed(layout) };
        if base.is_null() {
            alloc::alloc::handle_alloc_error(layout);
        }
        Self {
            base,
            page_count,
            owned: true,
            state: Mutex::new(PoolState::new(page_count)),
        }
    }

    fn layout(page_count: usize) -> Layout {
        Layout::from_size_align(page_count * PAGE_SIZE, PAGE_SIZE)
            .expect("pool layout overflow")
    }

    /// Number of frames in the pool.
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Number of currently free frames.
    pub fn free_pages(&self) -> usize {
        self.state.lock().free_count
    }

    /// Take one free frame, optionally zeroed.
    pub fn alloc(&self, zeroed: bool) -> Option<Frame> {
        let frame = self.state.lock().take_free()?;
        if zeroed {
            self.zero_frame(frame);
        }
        Some(frame)
    }

    /// Return a frame to the pool.
    pub fn free(&self, frame: Frame) {
        self.state.lock().put_back(frame);
    }

    /// Raw pointer to a frame's first byte.
    pub fn frame_ptr(&self, frame: Frame) -> *mut u8 {
        debug_assert!(frame.index() < self.page_count);
        // SAFETY: the frame index is in range, so the offset stays inside
        // the pool region.
        unsafe { self.base.add(frame.index() * PAGE_SIZE) }
    }

    /// Borrow a frame's bytes mutably.
    ///
    /// # Safety
    ///
    /// The caller must hold exclusive use of `frame`'s content: either it
    /// owns the frame and no user mapping exists yet, or it runs under the
    /// eviction lock.
    pub unsafe fn frame_bytes(&self, frame: Frame) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.frame_ptr(frame), PAGE_SIZE)
    }

    /// Zero a whole frame.
    pub fn zero_frame(&self, frame: Frame) {
        // SAFETY: in-range frame, and the pool region is writable.
        unsafe {
            core::ptr::write_bytes(self.frame_ptr(frame), 0, PAGE_SIZE);
        }
    }

    /// Copy bytes into a frame at `offset`.
    pub fn copy_into_frame(&self, frame: Frame, offset: usize, src: &[u8]) {
        debug_assert!(offset + src.len() <= PAGE_SIZE);
        // SAFETY: the range stays within one in-range frame.
        unsafe {
            core::ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.frame_ptr(frame).add(offset),
                src.len(),
            );
        }
    }

    /// Copy bytes out of a frame at `offset`.
    pub fn copy_from_frame(&self, frame: Frame, offset: usize, dst: &mut [u8]) {
        debug_assert!(offset + dst.len() <= PAGE_SIZE);
        // SAFETY: the range stays within one in-range frame.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.frame_ptr(frame).add(offset),
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
    }

    /// Copy a whole frame's content into another frame.
    pub fn copy_frame(&self, src: Frame, dst: Frame) {
        debug_assert_ne!(src, dst);
        // SAFETY: distinct in-range frames cannot overlap.
        unsafe {
            core::ptr::copy_nonoverlapping(self.frame_ptr(src), self.frame_ptr(dst), PAGE_SIZE);
        }
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        if self.owned {
            // SAFETY: base came from alloc_zeroed with the same layout.
            unsafe {
                alloc::alloc::dealloc(self.base, Self::layout(self.page_count));
            }
        }
    }
}

// ============================================================================
// Free Bitmap
// ============================================================================

impl PoolState {
    fn new(page_count: usize) -> Self {
        Self {
            used: vec![0u64; page_count.div_ceil(64)],
            free_count: page_count,
        }
    }

    fn take_free(&mut self) -> Option<Frame> {
        if self.free_count == 0 {
            return None;
        }
        // Bits past page_count in the last word are never set, so with
        // free_count > 0 the lowest clear bit is always an in-range frame.
        for (word_idx, word) in self.used.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                *word |= 1 << bit;
                self.free_count -= 1;
                return Some(Frame((word_idx * 64 + bit) as u32));
            }
        }
        None
    }

    fn put_back(&mut self, frame: Frame) {
        let word = frame.index() / 64;
        let bit = frame.index() % 64;
        debug_assert!(self.used[word] & (1 << bit) != 0, "double free of frame");
        self.used[word] &= !(1 << bit);
        self.free_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_cycle() {
        let pool = PagePool::with_pages(4);
        assert_eq!(pool.free_pages(), 4);

        let a = pool.alloc(false).unwrap();
        let b = pool.alloc(false).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.free_pages(), 2);

        pool.free(a);
        assert_eq!(pool.free_pages(), 3);
        let c = pool.alloc(false).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_exhaustion() {
        let pool = PagePool::with_pages(2);
        let _a = pool.alloc(false).unwrap();
        let _b = pool.alloc(false).unwrap();
        assert!(pool.alloc(false).is_none());
    }

    #[test]
    fn test_zeroed_and_copy() {
        let pool = PagePool::with_pages(2);
        let a = pool.alloc(true).unwrap();

        pool.copy_into_frame(a, 100, b"paging");
        let mut buf = [0u8; 6];
        pool.copy_from_frame(a, 100, &mut buf);
        assert_eq!(&buf, b"paging");

        let b = pool.alloc(false).unwrap();
        pool.copy_frame(a, b);
        pool.copy_from_frame(b, 100, &mut buf);
        assert_eq!(&buf, b"paging");

        pool.zero_frame(a);
        pool.copy_from_frame(a, 100, &mut buf);
        assert_eq!(buf, [0u8; 6]);
    }
}
