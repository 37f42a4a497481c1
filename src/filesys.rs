//! Filesystem Collaborator
//!
//! Handle-based file access for demand paging: segment loads, mmap
//! faults, and dirty-page write-back. Name resolution, directories, and
//! open/close dispatch live outside the VM core; only offset-addressed
//! reads and writes against an already-open file object are consumed
//! here, always under the context's single file lock.
//!
//! [`MemFs`] is the reference implementation used by hosted embedders and
//! the tests: files are byte vectors with fixed length, like the teaching
//! kernel's flat filesystem (writes never grow a file).

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::types::FileId;

// ============================================================================
// Trait
// ============================================================================

/// Offset-addressed access to open file objects.
pub trait FileSystem: Send {
    /// Length of the file in bytes; 0 for unknown handles.
    fn length(&self, file: FileId) -> usize;

    /// Read up to `buf.len()` bytes at `offset`. Returns bytes read,
    /// short at end of file.
    fn read_at(&mut self, file: FileId, offset: usize, buf: &mut [u8]) -> usize;

    /// Write `buf` at `offset`. Returns bytes written, short at end of
    /// file: files have fixed length.
    fn write_at(&mut self, file: FileId, offset: usize, buf: &[u8]) -> usize;
}

// ============================================================================
// In-Memory Filesystem
// ============================================================================

/// Flat in-memory file store.
#[derive(Default)]
pub struct MemFs {
    files: BTreeMap<FileId, Vec<u8>>,
    next_id: u64,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a file with the given content and return its handle.
    pub fn create(&mut self, content: &[u8]) -> FileId {
        self.next_id += 1;
        let id = FileId(self.next_id);
        self.files.insert(id, content.to_vec());
        id
    }

    /// Full content of a file; empty for unknown handles.
    pub fn content(&self, file: FileId) -> &[u8] {
        self.files.get(&file).map_or(&[], |f| f.as_slice())
    }
}

impl FileSystem for MemFs {
    fn length(&self, file: FileId) -> usize {
        self.files.get(&file).map_or(0, Vec::len)
    }

    fn read_at(&mut self, file: FileId, offset: usize, buf: &mut [u8]) -> usize {
        let Some(content) = self.files.get(&file) else {
            return 0;
        };
        if offset >= content.len() {
            return 0;
        }
        let n = buf.len().min(content.len() - offset);
        buf[..n].copy_from_slice(&content[offset..offset + n]);
        n
    }

    fn write_at(&mut self, file: FileId, offset: usize, buf: &[u8]) -> usize {
        let Some(content) = self.files.get_mut(&file) else {
            return 0;
        };
        if offset >= content.len() {
            return 0;
        }
        let n = buf.len().min(content.len() - offset);
        content[offset..offset + n].copy_from_slice(&buf[..n]);
        n
    }
}
