//! Regions and address spaces.
//!
//! An [`AddressSpace`] owns a root page table and a set of non-overlapping
//! [`Region`]s, plus the free-range bookkeeping that hands out virtual
//! space. Dropping the space unmaps every region and returns every frame
//! it owns to the frame allocator.

use alloc::collections::BTreeMap;

use spin::Mutex;

use crate::memory::{MemoryError, PageMapper, RangeAllocator};
use crate::paging::{EntryFlags, PageSize, TableView, VirtualAddress};

/// A reservation of contiguous virtual pages with uniform flags and page
/// size. Plain metadata: the mapping state lives in the page tables of
/// the owning address space.
#[derive(Clone, Copy, Debug)]
pub struct Region {
    start: VirtualAddress,
    frames: usize,
    flags: EntryFlags,
    page_size: PageSize,
    /// Whether teardown should return the backing frames to the frame
    /// allocator. Regions created by `share` borrow frames owned by the
    /// source address space and only unmap.
    owned: bool,
}

impl Region {
    fn new(
        start: VirtualAddress,
        frames: usize,
        flags: EntryFlags,
        page_size: PageSize,
        owned: bool,
    ) -> Self {
        debug_assert!(start.is_aligned(page_size));
        Self {
            start,
            frames,
            flags,
            page_size,
            owned,
        }
    }

    pub fn start(&self) -> VirtualAddress {
        self.start
    }

    pub fn end(&self) -> VirtualAddress {
        self.start.next_by(self.size())
    }

    pub fn size(&self) -> usize {
        self.frames * self.page_size.bytes()
    }

    pub fn size_in_frames(&self) -> usize {
        self.frames
    }

    pub fn flags(&self) -> EntryFlags {
        self.flags
    }

    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    pub fn overlap(&self, other: &Region) -> bool {
        self.start <= other.end() && self.end() >= other.start
    }

    fn page_address(&self, page_index: usize) -> VirtualAddress {
        self.start.next_by(page_index * self.page_size.bytes())
    }

    /// Map frame `page_index` of the region at `physical_address`, with
    /// the region's flags and page size.
    fn map_page(
        &self,
        mapper: &mut PageMapper,
        root: TableView,
        physical_address: u64,
        page_index: usize,
    ) -> Result<(), MemoryError> {
        if page_index >= self.frames {
            return Err(MemoryError::OutOfBounds);
        }
        mapper.map(
            root,
            self.page_address(page_index),
            physical_address,
            self.page_size,
            self.flags,
        )
    }

    /// Allocate and map a single frame. Only meaningful for 4 KiB regions;
    /// larger page sizes need physically contiguous memory the frame
    /// allocator does not provide.
    fn allocate_page(
        &self,
        mapper: &mut PageMapper,
        root: TableView,
        page_index: usize,
    ) -> Result<(), MemoryError> {
        if page_index >= self.frames {
            return Err(MemoryError::OutOfBounds);
        }
        debug_assert_eq!(self.page_size, PageSize::Size4KiB);
        mapper.allocate_and_map(root, self.page_address(page_index), self.flags)
    }

    fn allocate(&self, mapper: &mut PageMapper, root: TableView) -> Result<(), MemoryError> {
        for page_index in 0..self.frames {
            self.allocate_page(mapper, root, page_index)?;
        }
        Ok(())
    }

    fn query_physical_address(
        &self,
        mapper: &PageMapper,
        root: TableView,
        page_index: usize,
    ) -> Option<u64> {
        if page_index >= self.frames {
            return None;
        }
        mapper.read(root, self.page_address(page_index))
    }
}

/// Owns a root page table and a set of non-overlapping regions covering
/// parts of `[start, start + size)`.
pub struct AddressSpace {
    mapper: &'static Mutex<PageMapper>,
    root_physical_address: u64,
    regions: BTreeMap<usize, Region>,
    ranges: RangeAllocator,
}

// The raw table pointers derived from `root_physical_address` are only
// dereferenced under the mapper lock, on the single core.
unsafe impl Send for AddressSpace {}

impl AddressSpace {
    /// Allocate a root table and cover `[start, start + size)` with free
    /// virtual range bookkeeping.
    pub fn make(
        mapper: &'static Mutex<PageMapper>,
        start: VirtualAddress,
        size: usize,
    ) -> Result<Self, MemoryError> {
        let root_physical_address = mapper.lock().create_page_table()?.physical_address();
        Ok(Self {
            mapper,
            root_physical_address,
            regions: BTreeMap::new(),
            ranges: RangeAllocator::new(start.data(), size),
        })
    }

    pub fn root_table_physical_address(&self) -> u64 {
        self.root_physical_address
    }

    fn root(&self, mapper: &PageMapper) -> TableView {
        mapper.table_view(self.root_physical_address)
    }

    /// Claim a virtual range, rounding `size` up to whole pages. With a
    /// fixed `start` the exact range is taken or `VirtualRangeInUse` is
    /// returned; otherwise the smallest fitting hole is used.
    pub fn reserve(
        &mut self,
        start: Option<VirtualAddress>,
        size: usize,
        flags: EntryFlags,
        page_size: PageSize,
    ) -> Result<Region, MemoryError> {
        self.reserve_inner(start, size, flags, page_size, true)
    }

    fn reserve_inner(
        &mut self,
        start: Option<VirtualAddress>,
        size: usize,
        flags: EntryFlags,
        page_size: PageSize,
        owned: bool,
    ) -> Result<Region, MemoryError> {
        let bytes = size.div_ceil(page_size.bytes()) * page_size.bytes();
        let frames = bytes / page_size.bytes();

        let start = match start {
            Some(address) => {
                self.ranges.allocate_at(address.data(), bytes)?;
                address
            }
            None => VirtualAddress::new(self.ranges.allocate(bytes)?),
        };

        let region = Region::new(start, frames, flags, page_size, owned);
        self.regions.insert(start.data(), region);
        Ok(region)
    }

    /// `reserve`, then allocate and map every page.
    pub fn allocate(
        &mut self,
        start: Option<VirtualAddress>,
        size: usize,
        flags: EntryFlags,
        page_size: PageSize,
    ) -> Result<Region, MemoryError> {
        let region = self.reserve(start, size, flags, page_size)?;
        let mut mapper = self.mapper.lock();
        let root = self.root(&mapper);
        region.allocate(&mut mapper, root)?;
        Ok(region)
    }

    /// Map frame `page_index` of `region` at `physical_address`.
    pub fn map_page(
        &mut self,
        region: &Region,
        physical_address: u64,
        page_index: usize,
    ) -> Result<(), MemoryError> {
        let mut mapper = self.mapper.lock();
        let root = self.root(&mapper);
        region.map_page(&mut mapper, root, physical_address, page_index)
    }

    /// Allocate and map frame `page_index` of `region`.
    pub fn allocate_page(&mut self, region: &Region, page_index: usize) -> Result<(), MemoryError> {
        let mut mapper = self.mapper.lock();
        let root = self.root(&mapper);
        region.allocate_page(&mut mapper, root, page_index)
    }

    /// The physical address frame `page_index` of `region` is mapped at,
    /// if any.
    pub fn query_physical_address(&self, region: &Region, page_index: usize) -> Option<u64> {
        let mapper = self.mapper.lock();
        let root = self.root(&mapper);
        region.query_physical_address(&mapper, root, page_index)
    }

    /// Map the frames backing `region` of `source` into this space under
    /// new flags. The frames stay owned by `source`; this space's copy of
    /// the region only unmaps on teardown, so `source` must not be torn
    /// down while the sharing space still uses the mapping.
    pub fn share(
        &mut self,
        source: &AddressSpace,
        region: &Region,
        flags: EntryFlags,
    ) -> Result<Region, MemoryError> {
        let shared = self.reserve_inner(None, region.size(), flags, region.page_size(), false)?;

        let mut mapper = self.mapper.lock();
        let source_root = source.root(&mapper);
        let root = self.root(&mapper);
        for frame in 0..region.size_in_frames() {
            let physical_address = region
                .query_physical_address(&mapper, source_root, frame)
                .ok_or(MemoryError::NotMapped)?;
            shared.map_page(&mut mapper, root, physical_address, frame)?;
        }

        Ok(shared)
    }

    /// Copy the root table entries covering `[start, end]` from another
    /// address space. Used to pin the kernel half into every user root.
    pub fn shallow_copy_root_mapping(
        &mut self,
        from: &AddressSpace,
        start: VirtualAddress,
        end: VirtualAddress,
    ) {
        let mapper = self.mapper.lock();
        let source = from.root(&mapper);
        let root = self.root(&mapper);
        for index in start.index_level4()..=end.index_level4() {
            let entry = source.at(index);
            root.at(index)
                .set_physical_address(entry.physical_address())
                .set_flags(entry.flags());
        }
    }

    /// Tear down a single region ahead of the space itself: unmap it,
    /// return any frames it owns, and hand its virtual range back to the
    /// free pool, coalescing with neighbouring free ranges. A region this
    /// space does not know is ignored.
    pub fn release(&mut self, region: &Region) {
        let Some(region) = self.regions.remove(&region.start().data()) else {
            return;
        };

        {
            let mut mapper = self.mapper.lock();
            let root = mapper.table_view(self.root_physical_address);
            if region.owned {
                mapper.unmap_and_deallocate_range(root, region.start(), region.size());
            } else {
                mapper.unmap_range(root, region.start(), region.size());
            }
        }

        self.ranges.deallocate(region.start().data(), region.size());
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let mut mapper = self.mapper.lock();
        let root = mapper.table_view(self.root_physical_address);
        for region in self.regions.values() {
            if region.owned {
                mapper.unmap_and_deallocate_range(root, region.start(), region.size());
            } else {
                mapper.unmap_range(root, region.start(), region.size());
            }
        }
        mapper.deallocate_frame(self.root_physical_address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tests::Arena;
    use crate::memory::{Block, FrameAllocator};
    use crate::paging::PAGE_SIZE;
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    const FRAMES: usize = 128;

    fn static_mapper(arena: &Arena<{ FRAMES * PAGE_SIZE }>) -> &'static Mutex<PageMapper> {
        let map = [Block {
            start_address: 0x1000,
            size: (FRAMES - 1) * PAGE_SIZE,
        }];
        let mapper = unsafe {
            let allocator = FrameAllocator::new(map.into_iter(), arena.identity());
            PageMapper::new(arena.identity(), allocator)
        };
        Box::leak(Box::new(Mutex::new(mapper)))
    }

    fn free_frame_count(mapper: &Mutex<PageMapper>) -> usize {
        let mut drained = Vec::new();
        let mut mapper = mapper.lock();
        while let Ok(frame) = mapper.allocate_frame() {
            drained.push(frame.physical_address);
        }
        for &frame in drained.iter().rev() {
            mapper.deallocate_frame(frame);
        }
        drained.len()
    }

    #[test]
    fn fixed_reservations_conflict() {
        let arena = Arena::new();
        let mapper = static_mapper(&arena);
        let mut space =
            AddressSpace::make(mapper, VirtualAddress::new(0x1000), 0x100_0000).unwrap();

        space
            .reserve(
                Some(VirtualAddress::new(0x1000)),
                0x2000,
                EntryFlags::PRESENT,
                PageSize::Size4KiB,
            )
            .unwrap();
        assert_eq!(
            space
                .reserve(
                    Some(VirtualAddress::new(0x2000)),
                    0x1000,
                    EntryFlags::PRESENT,
                    PageSize::Size4KiB,
                )
                .map(|_| ()),
            Err(MemoryError::VirtualRangeInUse)
        );
    }

    #[test]
    fn regions_never_overlap() {
        let arena = Arena::new();
        let mapper = static_mapper(&arena);
        let mut space =
            AddressSpace::make(mapper, VirtualAddress::new(0x0), 0x100_0000).unwrap();

        for _ in 0..8 {
            space
                .reserve(None, 0x3000, EntryFlags::PRESENT, PageSize::Size4KiB)
                .unwrap();
        }

        let regions: Vec<Region> = space.regions().copied().collect();
        for (i, a) in regions.iter().enumerate() {
            for b in regions.iter().skip(i + 1) {
                assert!(a.end() <= b.start() || b.end() <= a.start());
            }
        }
    }

    #[test]
    fn reservation_rounds_size_up_to_whole_pages() {
        let arena = Arena::new();
        let mapper = static_mapper(&arena);
        let mut space =
            AddressSpace::make(mapper, VirtualAddress::new(0x0), 0x100_0000).unwrap();

        let region = space
            .reserve(None, 0x1001, EntryFlags::PRESENT, PageSize::Size4KiB)
            .unwrap();
        assert_eq!(region.size_in_frames(), 2);
        assert_eq!(region.size(), 0x2000);
    }

    #[test]
    fn page_indices_are_bounds_checked() {
        let arena = Arena::new();
        let mapper = static_mapper(&arena);
        let mut space =
            AddressSpace::make(mapper, VirtualAddress::new(0x0), 0x100_0000).unwrap();

        let region = space
            .reserve(None, 0x2000, EntryFlags::PRESENT, PageSize::Size4KiB)
            .unwrap();
        assert_eq!(
            space.map_page(&region, 0x5000, 2),
            Err(MemoryError::OutOfBounds)
        );
        assert_eq!(space.allocate_page(&region, 2), Err(MemoryError::OutOfBounds));
    }

    #[test]
    fn overlap_is_inclusive_of_touching_bounds() {
        let a = Region::new(
            VirtualAddress::new(0x1000),
            1,
            EntryFlags::PRESENT,
            PageSize::Size4KiB,
            true,
        );
        let b = Region::new(
            VirtualAddress::new(0x2000),
            1,
            EntryFlags::PRESENT,
            PageSize::Size4KiB,
            true,
        );
        let c = Region::new(
            VirtualAddress::new(0x4000),
            1,
            EntryFlags::PRESENT,
            PageSize::Size4KiB,
            true,
        );

        assert!(a.overlap(&b));
        assert!(b.overlap(&a));
        assert!(!a.overlap(&c));
    }

    #[test]
    fn drop_returns_every_owned_frame() {
        let arena = Arena::new();
        let mapper = static_mapper(&arena);
        let before = free_frame_count(mapper);

        {
            let mut space =
                AddressSpace::make(mapper, VirtualAddress::new(0x0), 0x100_0000).unwrap();
            space
                .allocate(
                    Some(VirtualAddress::new(0x1000)),
                    64 * 1024,
                    EntryFlags::PRESENT | EntryFlags::WRITABLE,
                    PageSize::Size4KiB,
                )
                .unwrap();

            // 16 data frames, the root, and three intermediate tables are
            // out of the pool while the space is alive
            assert_eq!(free_frame_count(mapper), before - 16 - 1 - 3);
        }

        // The data frames and the root come back; the intermediate tables
        // are not reclaimed
        assert_eq!(free_frame_count(mapper), before - 3);
    }

    #[test]
    fn share_maps_the_source_frames_under_new_flags() {
        let arena = Arena::new();
        let mapper = static_mapper(&arena);
        let mut source =
            AddressSpace::make(mapper, VirtualAddress::new(0x0), 0x100_0000).unwrap();
        let mut sharer =
            AddressSpace::make(mapper, VirtualAddress::new(0x0), 0x100_0000).unwrap();

        let region = source
            .allocate(
                Some(VirtualAddress::new(0x3000)),
                0x2000,
                EntryFlags::PRESENT | EntryFlags::WRITABLE,
                PageSize::Size4KiB,
            )
            .unwrap();
        let shared = sharer
            .share(
                &source,
                &region,
                EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER_ACCESSIBLE,
            )
            .unwrap();

        // Every page of the shared region resolves to the source's frames
        for frame in 0..region.size_in_frames() {
            assert_eq!(
                sharer.query_physical_address(&shared, frame),
                source.query_physical_address(&region, frame)
            );
        }

        // Tearing down the sharer does not free the source's frames: they
        // still read back, and the pool shrinks only by the sharer's own
        // root table (its intermediate tables having leaked)
        let with_both = free_frame_count(mapper);
        drop(sharer);
        assert!(source.query_physical_address(&region, 0).is_some());
        assert_eq!(free_frame_count(mapper), with_both + 1);
    }

    #[test]
    fn released_regions_free_their_frames_and_their_range() {
        let arena = Arena::new();
        let mapper = static_mapper(&arena);
        // A space just big enough for two regions, so reuse below can
        // only succeed if release coalesces the freed ranges
        let mut space = AddressSpace::make(mapper, VirtualAddress::new(0x0), 0x4000).unwrap();
        let before = free_frame_count(mapper);

        let first = space
            .allocate(
                Some(VirtualAddress::new(0x0)),
                0x2000,
                EntryFlags::PRESENT | EntryFlags::WRITABLE,
                PageSize::Size4KiB,
            )
            .unwrap();
        let second = space
            .allocate(
                Some(VirtualAddress::new(0x2000)),
                0x2000,
                EntryFlags::PRESENT | EntryFlags::WRITABLE,
                PageSize::Size4KiB,
            )
            .unwrap();
        assert!(space.reserve(None, 0x1000, EntryFlags::PRESENT, PageSize::Size4KiB).is_err());

        space.release(&first);
        space.release(&second);

        // The four data frames come back; the intermediate tables stay
        assert_eq!(free_frame_count(mapper), before - 3);
        assert_eq!(space.query_physical_address(&first, 0), None);

        // The two freed ranges merged: the whole space is one block again
        let whole = space
            .reserve(None, 0x4000, EntryFlags::PRESENT, PageSize::Size4KiB)
            .unwrap();
        assert_eq!(whole.start().data(), 0x0);
    }

    #[test]
    fn share_fails_on_unmapped_source_pages() {
        let arena = Arena::new();
        let mapper = static_mapper(&arena);
        let mut source =
            AddressSpace::make(mapper, VirtualAddress::new(0x0), 0x100_0000).unwrap();
        let mut sharer =
            AddressSpace::make(mapper, VirtualAddress::new(0x0), 0x100_0000).unwrap();

        // Reserved but never mapped
        let region = source
            .reserve(None, 0x2000, EntryFlags::PRESENT, PageSize::Size4KiB)
            .unwrap();
        assert_eq!(
            sharer.share(&source, &region, EntryFlags::PRESENT).map(|_| ()),
            Err(MemoryError::NotMapped)
        );
    }
}
