//! # Paging
//!
//! Four-level page tables, walked and mutated through the identity-mapped
//! window over physical memory.

pub use self::entry::{EntryFlags, TableEntryView};
pub use self::mapper::{PageFrame, PageMapper};
pub use self::table::TableView;

pub mod entry;
pub mod mapper;
pub mod table;

/// Number of entries per page table
pub const ENTRY_COUNT: usize = 512;

/// Size of the smallest page
pub const PAGE_SIZE: usize = 4096;

/// Leaf sizes supported by the mapper, each installed at a distinct table
/// level.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum PageSize {
    Size4KiB = 0x1000,
    Size2MiB = 0x20_0000,
    Size1GiB = 0x4000_0000,
}

impl PageSize {
    pub fn bytes(self) -> usize {
        self as u32 as usize
    }
}

/// A canonical virtual address, decomposable into its four table indices.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct VirtualAddress(usize);

impl VirtualAddress {
    pub const fn new(address: usize) -> Self {
        Self(address)
    }

    pub fn data(self) -> usize {
        self.0
    }

    pub fn index_level4(self) -> usize {
        (self.0 >> 39) & 0x1FF
    }

    pub fn index_level3(self) -> usize {
        (self.0 >> 30) & 0x1FF
    }

    pub fn index_level2(self) -> usize {
        (self.0 >> 21) & 0x1FF
    }

    pub fn index_level1(self) -> usize {
        (self.0 >> 12) & 0x1FF
    }

    pub fn is_aligned(self, page_size: PageSize) -> bool {
        self.0 % page_size.bytes() == 0
    }

    pub fn next_by(self, bytes: usize) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl From<usize> for VirtualAddress {
    fn from(address: usize) -> Self {
        Self(address)
    }
}

/// Round down to the nearest multiple of page size
pub fn round_down_pages(number: usize) -> usize {
    number / PAGE_SIZE * PAGE_SIZE
}
/// Round up to the nearest multiple of page size
pub fn round_up_pages(number: usize) -> usize {
    round_down_pages(number + PAGE_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_select_nine_bit_groups() {
        let address = VirtualAddress::new(0xFFFF_8000_4020_1000);
        assert_eq!(address.index_level4(), 256);
        assert_eq!(address.index_level3(), 1);
        assert_eq!(address.index_level2(), 1);
        assert_eq!(address.index_level1(), 1);
    }

    #[test]
    fn rounding() {
        assert_eq!(round_down_pages(0x1FFF), 0x1000);
        assert_eq!(round_up_pages(0x1001), 0x2000);
        assert_eq!(round_up_pages(0x1000), 0x1000);
    }
}
