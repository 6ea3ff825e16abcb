use alloc::collections::VecDeque;
use core::fmt;
use spin::Mutex;

use crate::devices::graphical_debug::DEBUG_DISPLAY;

pub static LOG: Mutex<Option<Log>> = Mutex::new(None);

pub fn init() {
    *LOG.lock() = Some(Log::new(64 * 1024));
}

/// In-memory ring of recent console output, readable post mortem from a
/// debugger attached to the VM.
pub struct Log {
    data: VecDeque<u8>,
    size: usize,
}

impl Log {
    pub fn new(size: usize) -> Log {
        Log {
            data: VecDeque::with_capacity(size),
            size,
        }
    }

    pub fn read(&self) -> (&[u8], &[u8]) {
        self.data.as_slices()
    }

    pub fn write(&mut self, buf: &[u8]) {
        for &b in buf {
            while self.data.len() + 1 >= self.size {
                self.data.pop_front();
            }
            self.data.push_back(b);
        }
    }
}

/// Writer for `print!`/`println!`: copies bytes into the log ring and onto
/// the framebuffer console when one is present.
pub struct Writer;

impl Writer {
    pub fn new() -> Self {
        Writer
    }

    pub fn write(&mut self, buf: &[u8]) {
        if let Some(ref mut log) = *LOG.lock() {
            log.write(buf);
        }

        if let Some(ref mut display) = *DEBUG_DISPLAY.lock() {
            display.write(buf);
        }
    }
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> Result<(), fmt::Error> {
        self.write(s.as_bytes());
        Ok(())
    }
}

struct KernelLogger {
    log_func: fn(&log::Record),
}

impl ::log::Log for KernelLogger {
    fn enabled(&self, _: &log::Metadata<'_>) -> bool {
        false
    }
    fn log(&self, record: &log::Record<'_>) {
        (self.log_func)(record)
    }
    fn flush(&self) {}
}

static LOGGER: spin::Once<KernelLogger> = spin::Once::new();

pub fn init_logger(func: fn(&log::Record)) {
    if LOGGER.is_completed() {
        ::log::info!("Tried to reinitialize the logger, which is not possible. Ignoring.");
        return;
    }

    let logger = LOGGER.call_once(|| KernelLogger { log_func: func });
    ::log::set_max_level(::log::LevelFilter::Info);
    match ::log::set_logger(logger) {
        Ok(_) => ::log::info!("Logger initialized."),
        Err(e) => println!("Logger setup failed! error: {}", e),
    }
}

pub use log::{debug, error, info, warn};
