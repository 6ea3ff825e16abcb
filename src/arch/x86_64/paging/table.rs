//! # Page table view

use super::entry::TableEntryView;
use super::ENTRY_COUNT;

/// A non-owning view of one 512-entry page table: the virtual window the
/// table is visible through, paired with its physical address.
#[derive(Clone, Copy)]
pub struct TableView {
    ptr: *mut u64,
    physical_address: u64,
}

impl TableView {
    /// # Safety
    ///
    /// `ptr` must point at a live, 4 KiB-aligned page table that is mapped
    /// for the lifetime of the view, and `physical_address` must be the
    /// table's physical location.
    pub unsafe fn new(ptr: *mut u64, physical_address: u64) -> Self {
        Self {
            ptr,
            physical_address,
        }
    }

    pub fn at(self, index: usize) -> TableEntryView {
        debug_assert!(index < ENTRY_COUNT);
        unsafe { TableEntryView::new(self.ptr.add(index)) }
    }

    pub fn physical_address(self) -> u64 {
        self.physical_address
    }
}
