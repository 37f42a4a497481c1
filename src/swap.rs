//! Swap Device
//!
//! Block-indexed store for evicted page content with no permanent file
//! backing. The VM core consumes the trait; slot accounting (the swap
//! bitmap) belongs to the device.
//!
//! [`MemSwap`] is the reference implementation: a fixed number of
//! page-sized slots held in memory, which is what the hosted tests and the
//! teaching kernel's RAM-disk swap both want.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::types::{SwapSlot, PAGE_SIZE};

// ============================================================================
// Device Trait
// ============================================================================

/// An indexed store of evicted pages.
pub trait SwapDevice: Send {
    /// Write one page of content into a free slot. `None` when the device
    /// is full; the caller fails the allocation that forced the eviction.
    fn swap_out(&mut self, page: &[u8]) -> Option<SwapSlot>;

    /// Read a slot's content back into `page`. The slot stays allocated
    /// until [`SwapDevice::free_slot`].
    fn swap_in(&mut self, slot: SwapSlot, page: &mut [u8]);

    /// Release a slot for reuse.
    fn free_slot(&mut self, slot: SwapSlot);

    /// Free slots remaining; used for logging only.
    fn free_slots(&self) -> usize;
}

// ============================================================================
// In-Memory Device
// ============================================================================

/// Fixed-capacity in-memory swap.
pub struct MemSwap {
    slots: Vec<Option<Box<[u8]>>>,
    free_count: usize,
}

impl MemSwap {
    /// Create a device with `slot_count` page slots.
    pub fn new(slot_count: usize) -> Self {
        Self {
            slots: vec![None; slot_count],
            free_count: slot_count,
        }
    }

    /// Total slot capacity.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl SwapDevice for MemSwap {
    fn swap_out(&mut self, page: &[u8]) -> Option<SwapSlot> {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        let index = self.slots.iter().position(|s| s.is_none())?;
        self.slots[index] = Some(page.to_vec().into_boxed_slice());
        self.free_count -= 1;
        Some(SwapSlot(index as u32))
    }

    fn swap_in(&mut self, slot: SwapSlot, page: &mut [u8]) {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        let content = self.slots[slot.0 as usize]
            .as_ref()
            .expect("swap_in of free slot");
        page.copy_from_slice(content);
    }

    fn free_slot(&mut self, slot: SwapSlot) {
        debug_assert!(self.slots[slot.0 as usize].is_some(), "double slot free");
        self.slots[slot.0 as usize] = None;
        self.free_count += 1;
    }

    fn free_slots(&self) -> usize {
        self.free_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut swap = MemSwap::new(2);
        let mut page = [0u8; PAGE_SIZE];
        page[17] = 0xAB;

        let slot = swap.swap_out(&page).unwrap();
        let mut back = [0u8; PAGE_SIZE];
        swap.swap_in(slot, &mut back);
        assert_eq!(back[17], 0xAB);

        swap.free_slot(slot);
        assert_eq!(swap.free_slots(), 2);
    }

    #[test]
    fn test_exhaustion_and_reuse() {
        let mut swap = MemSwap::new(1);
        let page = [0u8; PAGE_SIZE];

        let slot = swap.swap_out(&page).unwrap();
        assert!(swap.swap_out(&page).is_none());

        swap.free_slot(slot);
        assert!(swap.swap_out(&page).is_some());
    }
}
