use core::alloc::{GlobalAlloc, Layout};

use spin::Mutex;

pub use self::bump::BumpAllocator;

mod bump;

/// The initial heap, statically reserved so that early construction can
/// allocate before paging is up. The main heap takes over once the kernel
/// address space exists.
const INITIAL_HEAP_SIZE: usize = 4096;

#[repr(align(16))]
struct InitialHeap(core::cell::UnsafeCell<[u8; INITIAL_HEAP_SIZE]>);

// The arena is only ever carved up behind the HEAP mutex
unsafe impl Sync for InitialHeap {}

static INITIAL_HEAP: InitialHeap =
    InitialHeap(core::cell::UnsafeCell::new([0; INITIAL_HEAP_SIZE]));

/// Serves from the initial bump arena until it is exhausted, then from the
/// main heap bump installed by `init`.
pub struct FallbackAllocator {
    initial: BumpAllocator,
    heap: Option<BumpAllocator>,
}

impl FallbackAllocator {
    fn alloc(&mut self, layout: Layout) -> *mut u8 {
        match self.initial.alloc(layout) {
            ptr if !ptr.is_null() => ptr,
            _ => match self.heap {
                Some(ref mut heap) => heap.alloc(layout),
                None => core::ptr::null_mut(),
            },
        }
    }
}

static HEAP: Mutex<Option<FallbackAllocator>> = Mutex::new(None);

/// Install the main heap over `[offset, offset + size)`. The range must be
/// mapped writable before this is called.
pub unsafe fn init(offset: usize, size: usize) {
    let mut heap = HEAP.lock();
    let fallback = heap.get_or_insert_with(initial_only);
    fallback.heap = Some(BumpAllocator::new(offset, size));
}

fn initial_only() -> FallbackAllocator {
    FallbackAllocator {
        initial: BumpAllocator::new(INITIAL_HEAP.0.get() as usize, INITIAL_HEAP_SIZE),
        heap: None,
    }
}

pub struct Allocator;

unsafe impl GlobalAlloc for Allocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        HEAP.lock().get_or_insert_with(initial_only).alloc(layout)
    }

    unsafe fn dealloc(&self, _ptr: *mut u8, _layout: Layout) {
        // Bump allocation does not reclaim. The kernel's steady state
        // allocates nothing; transient allocations are bounded by the 1 MiB
        // heap region.
    }
}
