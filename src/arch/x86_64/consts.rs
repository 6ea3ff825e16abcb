// Because the memory layout is so important to not be aliased, it is defined here, in one place.
//
//     0x0000_0000_0000_0000 .. 0x0000_7FFF_FFFF_FFFF   user
//     0x0000_8000_0000_0000 .. 0xFFFF_7FFF_FFFF_FFFF   canonical hole
//     0xFFFF_8000_0000_0000 .. 0xFFFF_FFFF_FFFF_FFFF   kernel

/// Base of the higher half: all of physical memory is mapped here with
/// 1 GiB pages
pub const PHYS_OFFSET: usize = 0xFFFF_8000_0000_0000;

/// First kernel virtual address
pub const KERNEL_OFFSET: usize = PHYS_OFFSET;

/// Size of the kernel half
pub const KERNEL_SPACE_SIZE: usize = 0x0000_8000_0000_0000;

/// First address beyond user space
pub const USER_END_OFFSET: usize = 0x0000_8000_0000_0000;

/// Size of the kernel heap region
pub const KERNEL_HEAP_SIZE: usize = 1024 * 1024;

/// Size of the kernel stack reserved at the very top of the address space
pub const KERNEL_STACK_SIZE: usize = 64 * 1024;

/// First address of the kernel stack
pub const KERNEL_STACK_OFFSET: usize = 0usize.wrapping_sub(KERNEL_STACK_SIZE);

/// Size of a user service's stack; its top touches the end of user space
pub const USER_STACK_SIZE: usize = 64 * 1024;

/// First address of a user service's stack
pub const USER_STACK_OFFSET: usize = USER_END_OFFSET - USER_STACK_SIZE;

/// Size of the per-thread IPC buffer shared between kernel and service
pub const IPC_BUFFER_SIZE: usize = 4096;

/// Depth of the interrupt event queue and of thread mailboxes
pub const QUEUE_DEPTH: usize = 256;
