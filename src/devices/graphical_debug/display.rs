use core::{cmp, ptr};

/// A linear 32-bit framebuffer. `stride` is in pixels, not bytes.
pub struct Display {
    pub width: usize,
    pub height: usize,
    pub stride: usize,
    data: *mut u32,
}

unsafe impl Send for Display {}

impl Display {
    pub fn new(width: usize, height: usize, stride: usize, data: *mut u32) -> Display {
        Display {
            width,
            height,
            stride,
            data,
        }
    }

    pub fn data_mut(&mut self) -> *mut u32 {
        self.data
    }

    /// Scroll up by `lines` pixel rows, blanking the exposed area.
    pub fn scroll(&mut self, lines: usize) {
        let offset = cmp::min(self.height, lines) * self.stride;
        let size = (self.stride * self.height) - offset;
        unsafe {
            let ptr = self.data;
            ptr::copy(ptr.add(offset), ptr, size);
            ptr::write_bytes(ptr.add(size), 0, offset);
        }
    }
}
