//! The kernel proper: owns the thread list, observes the CPU, loads the
//! initial service, and runs the dispatch loop.

pub use self::kernel::{BootConfig, Kernel, KernelError};

mod kernel;
mod loader;
