//! The entry to Rust. The bootloader leaves us in long mode with paging
//! on and interrupts disabled; everything else is built here.

use crate::devices::graphical_debug;
use crate::kernel::{BootConfig, Kernel};
use crate::log::info;
use crate::memory::Block;
use crate::startup::{self, BootBoot, FramebufferInfo, BOOTBOOT_MAGIC};

// Symbol names are the linker script's
#[allow(non_upper_case_globals)]
extern "C" {
    /// The BOOTBOOT header, mapped by the loader
    static bootboot: BootBoot;
    /// Linear framebuffer, mapped by the loader
    static fb: u8;
    /// Start of the kernel image
    static __code_start: u8;
    /// Start of the kernel's writable data
    static __writable_data_start: u8;
    /// End of the kernel's writable data
    static __writable_data_end: u8;
}

fn log_sink(record: &log::Record) {
    println!("{} -- {}", record.level(), record.args());
}

/// The entry point, named in the linker script.
#[no_mangle]
pub unsafe extern "C" fn kstart() -> ! {
    let framebuffer = FramebufferInfo {
        virtual_base: core::ptr::addr_of!(fb) as usize,
        size: { bootboot.fb_size } as usize,
        width: { bootboot.fb_width } as usize,
        height: { bootboot.fb_height } as usize,
        scanline: { bootboot.fb_scanline } as usize,
    };
    graphical_debug::init(framebuffer);
    crate::log::init_logger(log_sink);

    assert_eq!(&{ bootboot.magic }, BOOTBOOT_MAGIC, "not loaded by a BOOTBOOT loader");
    startup::register_bootloader_areas(&bootboot);

    let config = BootConfig {
        framebuffer,
        initrd: Block {
            start_address: { bootboot.initrd_ptr },
            size: { bootboot.initrd_size } as usize,
        },
        code_start: core::ptr::addr_of!(__code_start) as usize,
        writable_data_start: core::ptr::addr_of!(__writable_data_start) as usize,
        writable_data_end: core::ptr::addr_of!(__writable_data_end) as usize,
    };

    info!(
        "initrd at {:#x}, {} bytes",
        config.initrd.start_address, config.initrd.size
    );

    let kernel = Kernel::make(config)
        .unwrap_or_else(|error| panic!("kernel initialization failed: {:?}", error));

    kernel.run()
}
