//! # Page mapper
//!
//! Reads, creates, mutates and tears down 4-level page tables. All table
//! memory is reached through the identity window, so the mapper can operate
//! on any address space, active or not.

use crate::memory::{Block, FrameAllocator, IdentityMapping, MemoryError};

use super::entry::{EntryFlags, TableEntryView};
use super::table::TableView;
use super::{PageSize, VirtualAddress, ENTRY_COUNT, PAGE_SIZE};

/// A freshly allocated frame together with its view through the identity
/// window.
pub struct PageFrame {
    pub ptr: *mut u8,
    pub physical_address: u64,
}

pub struct PageMapper {
    identity: IdentityMapping,
    frame_allocator: FrameAllocator,
}

impl PageMapper {
    /// # Safety
    ///
    /// `identity` must map all physical memory that page tables will ever
    /// live in, and must match the window the frame allocator uses.
    pub unsafe fn new(identity: IdentityMapping, frame_allocator: FrameAllocator) -> Self {
        Self {
            identity,
            frame_allocator,
        }
    }

    /// Bind the identity window over the table at `physical_address`.
    pub fn table_view(&self, physical_address: u64) -> TableView {
        unsafe {
            TableView::new(
                self.identity.translate(physical_address) as *mut u64,
                physical_address,
            )
        }
    }

    /// Allocate a frame and format it as an empty page table.
    pub fn create_page_table(&mut self) -> Result<TableView, MemoryError> {
        let frame = self.frame_allocator.alloc()?;
        let table = self.table_view(frame.start_address);
        for index in 0..ENTRY_COUNT {
            table.at(index).clear();
        }
        Ok(table)
    }

    /// Install a leaf mapping `virtual_address -> physical_address`.
    ///
    /// Intermediate tables are created on demand with
    /// `PRESENT | WRITABLE | USER_ACCESSIBLE` so that a user-accessible
    /// leaf is actually reachable; the leaf itself gets exactly the
    /// caller's flags (plus `HUGE_PAGE` for the large sizes). A present
    /// leaf is never replaced.
    pub fn map(
        &mut self,
        root: TableView,
        virtual_address: VirtualAddress,
        physical_address: u64,
        page_size: PageSize,
        flags: EntryFlags,
    ) -> Result<(), MemoryError> {
        let table3 = self.ensure_page_table(root.at(virtual_address.index_level4()))?;
        if page_size == PageSize::Size1GiB {
            return Self::install_leaf(
                table3.at(virtual_address.index_level3()),
                physical_address,
                flags | EntryFlags::HUGE_PAGE,
            );
        }

        let table2 = self.ensure_page_table(table3.at(virtual_address.index_level3()))?;
        if page_size == PageSize::Size2MiB {
            return Self::install_leaf(
                table2.at(virtual_address.index_level2()),
                physical_address,
                flags | EntryFlags::HUGE_PAGE,
            );
        }

        let table1 = self.ensure_page_table(table2.at(virtual_address.index_level2()))?;
        Self::install_leaf(
            table1.at(virtual_address.index_level1()),
            physical_address,
            flags,
        )
    }

    /// Translate `virtual_address`, or `None` when any level is absent.
    /// Huge leaves combine the leaf address with the offset within the
    /// page.
    pub fn read(&self, root: TableView, virtual_address: VirtualAddress) -> Option<u64> {
        let entry4 = root.at(virtual_address.index_level4());
        if !entry4.is_used() {
            return None;
        }

        let table3 = self.table_view(entry4.physical_address());
        let entry3 = table3.at(virtual_address.index_level3());
        if !entry3.is_used() {
            return None;
        }
        if entry3.flags().contains(EntryFlags::HUGE_PAGE) {
            let offset = virtual_address.data() as u64 % PageSize::Size1GiB.bytes() as u64;
            return Some(entry3.physical_address() + offset);
        }

        let table2 = self.table_view(entry3.physical_address());
        let entry2 = table2.at(virtual_address.index_level2());
        if !entry2.is_used() {
            return None;
        }
        if entry2.flags().contains(EntryFlags::HUGE_PAGE) {
            let offset = virtual_address.data() as u64 % PageSize::Size2MiB.bytes() as u64;
            return Some(entry2.physical_address() + offset);
        }

        let table1 = self.table_view(entry2.physical_address());
        let entry1 = table1.at(virtual_address.index_level1());
        if !entry1.is_used() {
            return None;
        }
        let offset = virtual_address.data() as u64 % PAGE_SIZE as u64;
        Some(entry1.physical_address() + offset)
    }

    /// Remove the leaf covering `virtual_address` and return the block it
    /// mapped, at the leaf's page size. `None` when nothing was mapped.
    pub fn unmap(&mut self, root: TableView, virtual_address: VirtualAddress) -> Option<Block> {
        let entry4 = root.at(virtual_address.index_level4());
        if !entry4.is_used() {
            return None;
        }

        let table3 = self.table_view(entry4.physical_address());
        let entry3 = table3.at(virtual_address.index_level3());
        if !entry3.is_used() {
            return None;
        }
        if entry3.flags().contains(EntryFlags::HUGE_PAGE) {
            let block = Block {
                start_address: entry3.physical_address(),
                size: PageSize::Size1GiB.bytes(),
            };
            entry3.clear();
            return Some(block);
        }

        let table2 = self.table_view(entry3.physical_address());
        let entry2 = table2.at(virtual_address.index_level2());
        if !entry2.is_used() {
            return None;
        }
        if entry2.flags().contains(EntryFlags::HUGE_PAGE) {
            let block = Block {
                start_address: entry2.physical_address(),
                size: PageSize::Size2MiB.bytes(),
            };
            entry2.clear();
            return Some(block);
        }

        let table1 = self.table_view(entry2.physical_address());
        let entry1 = table1.at(virtual_address.index_level1());
        if !entry1.is_used() {
            return None;
        }
        let block = Block {
            start_address: entry1.physical_address(),
            size: PAGE_SIZE,
        };
        entry1.clear();
        Some(block)
    }

    /// `unmap`, with the frames of the removed leaf returned to the
    /// allocator.
    pub fn unmap_and_deallocate(
        &mut self,
        root: TableView,
        virtual_address: VirtualAddress,
    ) -> Option<Block> {
        let block = self.unmap(root, virtual_address)?;
        let mut frame = block.start_address;
        while frame < block.end_address() {
            self.frame_allocator.dealloc(frame);
            frame += PAGE_SIZE as u64;
        }
        Some(block)
    }

    /// Allocate one frame, returning it with its identity-window pointer.
    pub fn allocate_frame(&mut self) -> Result<PageFrame, MemoryError> {
        let block = self.frame_allocator.alloc()?;
        Ok(PageFrame {
            ptr: self.identity.translate(block.start_address),
            physical_address: block.start_address,
        })
    }

    pub fn deallocate_frame(&mut self, physical_address: u64) {
        self.frame_allocator.dealloc(physical_address);
    }

    /// Allocate a frame and map it at `virtual_address` with 4 KiB
    /// granularity.
    pub fn allocate_and_map(
        &mut self,
        root: TableView,
        virtual_address: VirtualAddress,
        flags: EntryFlags,
    ) -> Result<(), MemoryError> {
        let block = self.frame_allocator.alloc()?;
        match self.map(
            root,
            virtual_address,
            block.start_address,
            PageSize::Size4KiB,
            flags,
        ) {
            Ok(()) => Ok(()),
            Err(error) => {
                self.frame_allocator.dealloc(block.start_address);
                Err(error)
            }
        }
    }

    /// `n_frames` contiguous 4 KiB mappings starting at `virtual_address`.
    pub fn allocate_and_map_range(
        &mut self,
        root: TableView,
        virtual_address: VirtualAddress,
        flags: EntryFlags,
        n_frames: usize,
    ) -> Result<(), MemoryError> {
        for frame in 0..n_frames {
            self.allocate_and_map(root, virtual_address.next_by(frame * PAGE_SIZE), flags)?;
        }
        Ok(())
    }

    /// Tear down `[virtual_address, virtual_address + size)`, best effort.
    /// Returns the number of bytes actually freed.
    pub fn unmap_and_deallocate_range(
        &mut self,
        root: TableView,
        virtual_address: VirtualAddress,
        size: usize,
    ) -> usize {
        let mut offset = 0;
        let mut freed = 0;
        while offset < size {
            match self.unmap_and_deallocate(root, virtual_address.next_by(offset)) {
                Some(block) => {
                    freed += block.size;
                    offset += block.size;
                }
                None => offset += PAGE_SIZE,
            }
        }
        freed
    }

    /// Remove leaves without touching the allocator, for mappings whose
    /// frames belong to another address space.
    pub fn unmap_range(&mut self, root: TableView, virtual_address: VirtualAddress, size: usize) {
        let mut offset = 0;
        while offset < size {
            match self.unmap(root, virtual_address.next_by(offset)) {
                Some(block) => offset += block.size,
                None => offset += PAGE_SIZE,
            }
        }
    }

    pub fn identity_mapping(&self) -> IdentityMapping {
        self.identity
    }

    /// Move the mapper (and its allocator) to a new identity window, after
    /// the kernel has remapped physical memory elsewhere.
    pub fn relocate(&mut self, identity: IdentityMapping) {
        self.identity = identity;
        self.frame_allocator.relocate(identity);
    }

    fn install_leaf(
        entry: TableEntryView,
        physical_address: u64,
        flags: EntryFlags,
    ) -> Result<(), MemoryError> {
        if entry.is_used() {
            return Err(MemoryError::AlreadyMapped);
        }
        entry
            .set_physical_address(physical_address)
            .set_flags(flags);
        Ok(())
    }

    fn ensure_page_table(&mut self, entry: TableEntryView) -> Result<TableView, MemoryError> {
        if entry.is_used() {
            return Ok(self.table_view(entry.physical_address()));
        }

        let table = self.create_page_table()?;
        entry
            .set_physical_address(table.physical_address())
            .set_flags(
                EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER_ACCESSIBLE,
            );
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tests::Arena;

    const FRAMES: usize = 64;

    fn mapper(arena: &Arena<{ FRAMES * PAGE_SIZE }>) -> PageMapper {
        let map = [Block {
            start_address: 0x1000,
            size: (FRAMES - 1) * PAGE_SIZE,
        }];
        unsafe {
            let allocator = FrameAllocator::new(map.into_iter(), arena.identity());
            PageMapper::new(arena.identity(), allocator)
        }
    }

    #[test]
    fn map_then_read_combines_the_page_offset() {
        let arena = Arena::new();
        let mut mapper = mapper(&arena);
        let root = mapper.create_page_table().unwrap();

        mapper
            .map(
                root,
                VirtualAddress::new(0x1000),
                0xDEAD_0000,
                PageSize::Size4KiB,
                EntryFlags::PRESENT | EntryFlags::WRITABLE,
            )
            .unwrap();

        assert_eq!(
            mapper.read(root, VirtualAddress::new(0x1123)),
            Some(0xDEAD_0123)
        );
        assert_eq!(mapper.read(root, VirtualAddress::new(0x2000)), None);
    }

    #[test]
    fn huge_leaves_terminate_the_walk() {
        let arena = Arena::new();
        let mut mapper = mapper(&arena);
        let root = mapper.create_page_table().unwrap();

        mapper
            .map(
                root,
                VirtualAddress::new(0x4000_0000),
                0x1_0000_0000,
                PageSize::Size1GiB,
                EntryFlags::PRESENT,
            )
            .unwrap();
        mapper
            .map(
                root,
                VirtualAddress::new(0x20_0000),
                0x60_0000,
                PageSize::Size2MiB,
                EntryFlags::PRESENT,
            )
            .unwrap();

        assert_eq!(
            mapper.read(root, VirtualAddress::new(0x4000_1234)),
            Some(0x1_0000_1234)
        );
        assert_eq!(
            mapper.read(root, VirtualAddress::new(0x20_0008)),
            Some(0x60_0008)
        );
    }

    #[test]
    fn occupied_leaves_are_never_replaced() {
        let arena = Arena::new();
        let mut mapper = mapper(&arena);
        let root = mapper.create_page_table().unwrap();

        let address = VirtualAddress::new(0x1000);
        mapper
            .map(root, address, 0x5000, PageSize::Size4KiB, EntryFlags::PRESENT)
            .unwrap();
        assert_eq!(
            mapper.map(root, address, 0x6000, PageSize::Size4KiB, EntryFlags::PRESENT),
            Err(MemoryError::AlreadyMapped)
        );
        // The original mapping is intact
        assert_eq!(mapper.read(root, address), Some(0x5000));
    }

    #[test]
    fn unmap_returns_the_leaf_block_and_forgets_the_mapping() {
        let arena = Arena::new();
        let mut mapper = mapper(&arena);
        let root = mapper.create_page_table().unwrap();

        let address = VirtualAddress::new(0x40_0000);
        mapper
            .map(root, address, 0x7000, PageSize::Size4KiB, EntryFlags::PRESENT)
            .unwrap();

        let block = mapper.unmap(root, address).unwrap();
        assert_eq!(block.start_address, 0x7000);
        assert_eq!(block.size, PAGE_SIZE);
        assert_eq!(mapper.read(root, address), None);
        assert_eq!(mapper.unmap(root, address), None);
    }

    #[test]
    fn deallocated_frames_come_back() {
        let arena = Arena::new();
        let mut mapper = mapper(&arena);
        let root = mapper.create_page_table().unwrap();

        let address = VirtualAddress::new(0x9000);
        mapper
            .allocate_and_map(root, address, EntryFlags::PRESENT | EntryFlags::WRITABLE)
            .unwrap();
        let mapped = mapper.read(root, address).unwrap();

        let freed = mapper.unmap_and_deallocate(root, address).unwrap();
        assert_eq!(freed.start_address, mapped);
        // LIFO: the very next frame allocation sees the freed frame again
        assert_eq!(
            mapper.allocate_frame().unwrap().physical_address,
            freed.start_address
        );
    }

    #[test]
    fn range_teardown_counts_freed_bytes() {
        let arena = Arena::new();
        let mut mapper = mapper(&arena);
        let root = mapper.create_page_table().unwrap();

        let base = VirtualAddress::new(0x10_0000);
        mapper
            .allocate_and_map_range(root, base, EntryFlags::PRESENT, 4)
            .unwrap();
        // Punch a hole; teardown is best-effort across it
        mapper.unmap_and_deallocate(root, base.next_by(PAGE_SIZE)).unwrap();

        let freed = mapper.unmap_and_deallocate_range(root, base, 4 * PAGE_SIZE);
        assert_eq!(freed, 3 * PAGE_SIZE);
    }

    #[test]
    fn allocation_fails_cleanly_when_frames_run_out() {
        let arena = Arena::<{ 4 * PAGE_SIZE }>::new();
        let map = [Block {
            start_address: 0x1000,
            size: 3 * PAGE_SIZE,
        }];
        let mut mapper = unsafe {
            let allocator = FrameAllocator::new(map.into_iter(), arena.identity());
            PageMapper::new(arena.identity(), allocator)
        };
        let root = mapper.create_page_table().unwrap();

        // Two frames remain: the level-3 table and one more. Mapping a 4 KiB
        // leaf needs two intermediate tables plus a data frame.
        assert_eq!(
            mapper.allocate_and_map(root, VirtualAddress::new(0x1000), EntryFlags::PRESENT),
            Err(MemoryError::OutOfPhysicalMemory)
        );
    }
}
