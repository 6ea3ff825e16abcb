use spin::Mutex;

pub use self::debug::DebugDisplay;
use self::display::Display;

use crate::startup::FramebufferInfo;

pub mod debug;
pub mod display;

pub static DEBUG_DISPLAY: Mutex<Option<DebugDisplay>> = Mutex::new(None);

/// Bring up the framebuffer console. Everything printed before this call
/// only reaches the in-memory log.
///
/// # Safety
///
/// `framebuffer.virtual_base` must point at a mapped linear framebuffer
/// of the given geometry, and nothing else may draw to it.
pub unsafe fn init(framebuffer: FramebufferInfo) {
    if framebuffer.virtual_base == 0 || framebuffer.width == 0 || framebuffer.height == 0 {
        return;
    }

    let display = Display::new(
        framebuffer.width,
        framebuffer.height,
        framebuffer.scanline / 4,
        framebuffer.virtual_base as *mut u32,
    );
    *DEBUG_DISPLAY.lock() = Some(DebugDisplay::new(display));
}
