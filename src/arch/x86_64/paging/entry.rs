//! # Page table entry

bitflags! {
    /// The recognized bits of a table entry. Everything else must stay
    /// zero.
    pub struct EntryFlags: u64 {
        const PRESENT =         1;
        const WRITABLE =        1 << 1;
        const USER_ACCESSIBLE = 1 << 2;
        const HUGE_PAGE =       1 << 7;
        const GLOBAL =          1 << 8;
        const NO_EXECUTE =      1 << 63;
    }
}

pub const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// A non-owning view of one 64-bit table entry.
#[derive(Clone, Copy)]
pub struct TableEntryView {
    entry: *mut u64,
}

impl TableEntryView {
    /// # Safety
    ///
    /// `entry` must point at a live page table entry, and the caller must
    /// not construct aliasing mutable views.
    pub unsafe fn new(entry: *mut u64) -> Self {
        Self { entry }
    }

    fn raw(self) -> u64 {
        unsafe { self.entry.read_volatile() }
    }

    fn write(self, value: u64) {
        unsafe { self.entry.write_volatile(value) }
    }

    /// An entry is in use iff any bit is set.
    pub fn is_used(self) -> bool {
        self.raw() != 0
    }

    pub fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.raw())
    }

    pub fn physical_address(self) -> u64 {
        self.raw() & ADDRESS_MASK
    }

    /// Replace the flag bits, preserving the address.
    pub fn set_flags(self, flags: EntryFlags) -> Self {
        self.write((self.raw() & !EntryFlags::all().bits()) | flags.bits());
        self
    }

    /// Replace the address bits, preserving the flags.
    pub fn set_physical_address(self, address: u64) -> Self {
        self.write((self.raw() & !ADDRESS_MASK) | (address & ADDRESS_MASK));
        self
    }

    pub fn clear(self) {
        self.write(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setters_preserve_the_other_half() {
        let mut raw = 0u64;
        let view = unsafe { TableEntryView::new(&mut raw) };

        view.set_physical_address(0xDEAD_B000)
            .set_flags(EntryFlags::PRESENT | EntryFlags::NO_EXECUTE);
        assert_eq!(view.physical_address(), 0xDEAD_B000);
        assert_eq!(view.flags(), EntryFlags::PRESENT | EntryFlags::NO_EXECUTE);

        view.set_physical_address(0x1000);
        assert_eq!(view.flags(), EntryFlags::PRESENT | EntryFlags::NO_EXECUTE);
        assert_eq!(view.physical_address(), 0x1000);

        view.clear();
        assert!(!view.is_used());
    }
}
