/// Framebuffer text console
pub mod graphical_debug;
