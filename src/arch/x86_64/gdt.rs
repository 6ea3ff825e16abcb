//! Global descriptor table.
//!
//! Seven fixed entries. User data sits *before* user code because SYSRET
//! derives both selectors from the single `IA32_STAR` base: SS at base+8,
//! CS at base+16.

use core::mem::size_of;

use x86::bits64::task::TaskStateSegment;
use x86::dtables::{self, DescriptorTablePointer};
use x86::segmentation::{self, Descriptor as SegmentDescriptor, SegmentSelector};
use x86::{task, Ring};

pub const GDT_NULL: usize = 0;
pub const GDT_KERNEL_CODE: usize = 1;
pub const GDT_KERNEL_DATA: usize = 2;
pub const GDT_USER_DATA: usize = 3;
pub const GDT_USER_CODE: usize = 4;
pub const GDT_TSS: usize = 5;
pub const GDT_TSS_HIGH: usize = 6;

pub const KERNEL_CODE_SELECTOR: u16 = (GDT_KERNEL_CODE as u16) << 3;
pub const KERNEL_DATA_SELECTOR: u16 = (GDT_KERNEL_DATA as u16) << 3;
pub const USER_DATA_SELECTOR: u16 = (GDT_USER_DATA as u16) << 3 | 3;
pub const USER_CODE_SELECTOR: u16 = (GDT_USER_CODE as u16) << 3 | 3;
/// Loaded into `IA32_STAR[63:48]`; SYSRET computes SS = base + 8 and
/// CS = base + 16, landing on the user data/code pair above.
pub const SYSRET_BASE_SELECTOR: u16 = (GDT_KERNEL_DATA as u16) << 3 | 3;

pub const GDT_A_PRESENT: u8 = 1 << 7;
pub const GDT_A_RING_0: u8 = 0 << 5;
pub const GDT_A_RING_3: u8 = 3 << 5;
pub const GDT_A_SYSTEM: u8 = 1 << 4;
pub const GDT_A_EXECUTABLE: u8 = 1 << 3;
pub const GDT_A_PRIVILEGE: u8 = 1 << 1;

pub const GDT_A_TSS_AVAIL: u8 = 0x9;

pub const GDT_F_LONG_MODE: u8 = 1 << 5;

/// The TSS entries are patched with the TSS address at install time.
pub const BASE_GDT: [GdtEntry; 7] = [
    // Null
    GdtEntry::new(0, 0, 0, 0),
    // Kernel code
    GdtEntry::new(
        0,
        0,
        GDT_A_PRESENT | GDT_A_RING_0 | GDT_A_SYSTEM | GDT_A_EXECUTABLE | GDT_A_PRIVILEGE,
        GDT_F_LONG_MODE,
    ),
    // Kernel data
    GdtEntry::new(
        0,
        0,
        GDT_A_PRESENT | GDT_A_RING_0 | GDT_A_SYSTEM | GDT_A_PRIVILEGE,
        GDT_F_LONG_MODE,
    ),
    // User data
    GdtEntry::new(
        0,
        0,
        GDT_A_PRESENT | GDT_A_RING_3 | GDT_A_SYSTEM | GDT_A_PRIVILEGE,
        GDT_F_LONG_MODE,
    ),
    // User (64-bit) code
    GdtEntry::new(
        0,
        0,
        GDT_A_PRESENT | GDT_A_RING_3 | GDT_A_SYSTEM | GDT_A_EXECUTABLE | GDT_A_PRIVILEGE,
        GDT_F_LONG_MODE,
    ),
    // TSS
    GdtEntry::new(0, 0, GDT_A_PRESENT | GDT_A_RING_3 | GDT_A_TSS_AVAIL, 0),
    // TSS descriptors are 16 bytes long, twice the normal size
    GdtEntry::new(0, 0, 0, 0),
];

#[derive(Copy, Clone, Debug)]
#[repr(C, packed)]
pub struct GdtEntry {
    pub limitl: u16,
    pub offsetl: u16,
    pub offsetm: u8,
    pub access: u8,
    pub flags_limith: u8,
    pub offseth: u8,
}

impl GdtEntry {
    pub const fn new(offset: u32, limit: u32, access: u8, flags: u8) -> Self {
        GdtEntry {
            limitl: limit as u16,
            offsetl: offset as u16,
            offsetm: (offset >> 16) as u8,
            access,
            flags_limith: flags & 0xF0 | ((limit >> 16) as u8) & 0x0F,
            offseth: (offset >> 24) as u8,
        }
    }

    pub fn set_offset(&mut self, offset: u32) {
        self.offsetl = offset as u16;
        self.offsetm = (offset >> 16) as u8;
        self.offseth = (offset >> 24) as u8;
    }

    pub fn set_limit(&mut self, limit: u32) {
        self.limitl = limit as u16;
        self.flags_limith = self.flags_limith & 0xF0 | ((limit >> 16) as u8) & 0x0F;
    }
}

/// Patch the TSS descriptor, load the table, reload every segment
/// register and the task register.
///
/// # Safety
///
/// `gdt` and `tss` must stay alive (and at their addresses) for as long
/// as the CPU can reference them, which is forever.
pub unsafe fn install(gdt: &mut [GdtEntry; 7], tss: &TaskStateSegment) {
    {
        let tss_address = tss as *const TaskStateSegment as u64;
        let tss_lo = (tss_address & 0xFFFF_FFFF) as u32;
        let tss_hi = (tss_address >> 32) as u32;

        gdt[GDT_TSS].set_offset(tss_lo);
        gdt[GDT_TSS].set_limit(size_of::<TaskStateSegment>() as u32);

        (&mut gdt[GDT_TSS_HIGH] as *mut GdtEntry)
            .cast::<u32>()
            .write(tss_hi);
    }

    dtables::lgdt(&DescriptorTablePointer {
        limit: (gdt.len() * size_of::<GdtEntry>() - 1) as u16,
        base: gdt.as_ptr() as *const SegmentDescriptor,
    });

    segmentation::load_cs(SegmentSelector::new(GDT_KERNEL_CODE as u16, Ring::Ring0));
    segmentation::load_ss(SegmentSelector::new(GDT_KERNEL_DATA as u16, Ring::Ring0));

    segmentation::load_ds(SegmentSelector::from_raw(0));
    segmentation::load_es(SegmentSelector::from_raw(0));
    segmentation::load_fs(SegmentSelector::from_raw(0));
    // GSBASE is re-established via MSR right after this returns
    segmentation::load_gs(SegmentSelector::from_raw(0));

    task::load_tr(SegmentSelector::new(GDT_TSS as u16, Ring::Ring0));
}
