//! A single-core x86-64 microkernel loaded by a BOOTBOOT-style bootloader.
//!
//! The kernel establishes a higher-half address space, manages physical
//! frames and per-process address spaces, dispatches hardware interrupts,
//! provides a fast syscall path with user/kernel context switching, and
//! loads one user service from the boot archive.

// Used for kernel::kernel-style nesting
#![allow(clippy::module_inception)]
// Not implementing default is sometimes useful in the case something has significant cost
// to allocate. If you implement default, it can be allocated without evidence using the
// ..Default::default() syntax. Not fun in kernel space
#![allow(clippy::new_without_default)]
// Used to allow stuff like 1 << 0 and 1 * 1024 * 1024
#![allow(clippy::identity_op)]
// This is usually a serious issue - a missing import of a define where it is interpreted
// as a catch-all variable in a match, for example
#![deny(unreachable_patterns)]
// Ensure that all must_use results are used
#![deny(unused_must_use)]
#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate alloc;

#[macro_use]
extern crate bitflags;

#[macro_use]
/// Shared data structures
mod common;

#[macro_use]
mod macros;

/// Architecture-dependent stuff
#[macro_use]
pub mod arch;
pub use crate::arch::*;

/// Heap allocators
mod allocator;

/// Thread management
pub mod context;

/// Architecture-independent devices
pub mod devices;

/// ELF file parsing
pub mod elf;

/// External functions
#[cfg(not(test))]
mod externs;

/// USTAR boot archive lookup
pub mod initrd;

/// Message passing
pub mod ipc;

/// The kernel proper: observer, dispatcher, process loading
#[cfg(all(target_arch = "x86_64", not(test)))]
pub mod kernel;

/// Logging
pub mod log;

/// Memory management
pub mod memory;

/// Panic
#[cfg(not(test))]
mod panic;

/// Early init
pub mod startup;

/// Synchronization primitives
pub mod sync;

#[cfg_attr(not(test), global_allocator)]
static ALLOCATOR: allocator::Allocator = allocator::Allocator;
