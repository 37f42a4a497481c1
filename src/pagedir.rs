//! Page Directory - Hardware Page Table Adapter
//!
//! Architecture-independent interface to one process's hardware page
//! table. The VM core only consumes mappings plus the per-page writable,
//! dirty, and accessed bits; walking and encoding real page tables is the
//! platform's business. Table creation is construction, destruction is
//! `Drop`.
//!
//! [`SoftPageDir`] is the reference implementation: a map-backed table
//! used by hosted embedders and the crate's own tests.

use alloc::collections::BTreeMap;

use crate::types::{Frame, VirtAddr};

// ============================================================================
// Adapter Trait
// ============================================================================

/// One process's virtual-to-physical mapping.
///
/// All addresses passed in are page-aligned user virtual addresses.
pub trait PageDir: Send {
    /// Install a mapping. Returns `false` when the table cannot take the
    /// entry (page-table page allocation failed) or the page is already
    /// mapped; the caller unwinds the frame.
    fn map(&mut self, vpage: VirtAddr, frame: Frame, writable: bool) -> bool;

    /// Remove a mapping; later accesses fault. No-op if absent.
    fn unmap(&mut self, vpage: VirtAddr);

    /// Frame currently mapped at `vpage`, if any.
    fn lookup(&self, vpage: VirtAddr) -> Option<Frame>;

    /// Whether the mapping at `vpage` permits writes.
    fn is_writable(&self, vpage: VirtAddr) -> bool;

    /// Flip the write permission on an existing mapping.
    fn set_writable(&mut self, vpage: VirtAddr, writable: bool);

    /// Hardware dirty bit for `vpage`.
    fn is_dirty(&self, vpage: VirtAddr) -> bool;

    /// Set or clear the dirty bit.
    fn set_dirty(&mut self, vpage: VirtAddr, dirty: bool);

    /// Hardware accessed bit for `vpage`.
    fn is_accessed(&self, vpage: VirtAddr) -> bool;

    /// Set or clear the accessed bit.
    fn set_accessed(&mut self, vpage: VirtAddr, accessed: bool);
}

// ============================================================================
// Soft Implementation
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct SoftMapping {
    frame: Frame,
    writable: bool,
    dirty: bool,
    accessed: bool,
}

/// Map-backed page directory for hosted use; hardware bits are driven
/// explicitly by whoever simulates the MMU.
#[derive(Default)]
pub struct SoftPageDir {
    mappings: BTreeMap<VirtAddr, SoftMapping>,
}

impl SoftPageDir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live mappings.
    pub fn mapped_pages(&self) -> usize {
        self.mappings.len()
    }
}

impl PageDir for SoftPageDir {
    fn map(&mut self, vpage: VirtAddr, frame: Frame, writable: bool) -> bool {
        if self.mappings.contains_key(&vpage) {
            return false;
        }
        self.mappings.insert(
            vpage,
            SoftMapping {
                frame,
                writable,
                dirty: false,
                accessed: true,
            },
        );
        true
    }

    fn unmap(&mut self, vpage: VirtAddr) {
        self.mappings.remove(&vpage);
    }

    fn lookup(&self, vpage: VirtAddr) -> Option<Frame> {
        self.mappings.get(&vpage).map(|m| m.frame)
    }

    fn is_writable(&self, vpage: VirtAddr) -> bool {
        self.mappings.get(&vpage).is_some_and(|m| m.writable)
    }

    fn set_writable(&mut self, vpage: VirtAddr, writable: bool) {
        if let Some(m) = self.mappings.get_mut(&vpage) {
            m.writable = writable;
        }
    }

    fn is_dirty(&self, vpage: VirtAddr) -> bool {
        self.mappings.get(&vpage).is_some_and(|m| m.dirty)
    }

    fn set_dirty(&mut self, vpage: VirtAddr, dirty: bool) {
        if let Some(m) = self.mappings.get_mut(&vpage) {
            m.dirty = dirty;
        }
    }

    fn is_accessed(&self, vpage: VirtAddr) -> bool {
        self.mappings.get(&vpage).is_some_and(|m| m.accessed)
    }

    fn set_accessed(&mut self, vpage: VirtAddr, accessed: bool) {
        if let Some(m) = self.mappings.get_mut(&vpage) {
            m.accessed = accessed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_unmap() {
        let mut pd = SoftPageDir::new();
        assert!(pd.map(0x1000, Frame(3), true));
        assert_eq!(pd.lookup(0x1000), Some(Frame(3)));
        assert!(pd.is_writable(0x1000));

        // Double-map is refused.
        assert!(!pd.map(0x1000, Frame(4), true));

        pd.unmap(0x1000);
        assert_eq!(pd.lookup(0x1000), None);
    }

    #[test]
    fn test_bits() {
        let mut pd = SoftPageDir::new();
        pd.map(0x2000, Frame(0), false);

        assert!(!pd.is_dirty(0x2000));
        pd.set_dirty(0x2000, true);
        assert!(pd.is_dirty(0x2000));

        assert!(pd.is_accessed(0x2000));
        pd.set_accessed(0x2000, false);
        assert!(!pd.is_accessed(0x2000));

        pd.set_writable(0x2000, true);
        assert!(pd.is_writable(0x2000));
    }
}
