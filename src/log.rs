// Kernel logging over the boot serial port.
//
// A single global level filter gates everything; the sink is COM1, brought
// up once during early init. Messages logged before that (or on a host
// build with no port) are dropped.

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn get_level() -> LogLevel {
    match LOG_LEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::Error,
        1 => LogLevel::Warn,
        2 => LogLevel::Info,
        3 => LogLevel::Debug,
        _ => LogLevel::Trace,
    }
}

#[inline]
pub fn is_enabled(level: LogLevel) -> bool {
    level <= get_level()
}

#[cfg(target_arch = "x86_64")]
mod sink {
    use core::fmt::{self, Write};
    use spin::Mutex;
    use uart_16550::SerialPort;

    const COM1: u16 = 0x3F8;

    static SERIAL: Mutex<Option<SerialPort>> = Mutex::new(None);

    /// Bring up the serial sink. Called once during early boot, before
    /// anything worth logging happens.
    pub fn init() {
        let mut port = unsafe { SerialPort::new(COM1) };
        port.init();
        *SERIAL.lock() = Some(port);
    }

    pub fn write(args: fmt::Arguments) {
        if let Some(port) = SERIAL.lock().as_mut() {
            let _ = port.write_fmt(args);
        }
    }
}

#[cfg(not(target_arch = "x86_64"))]
mod sink {
    use core::fmt;

    pub fn init() {}
    pub fn write(_args: fmt::Arguments) {}
}

pub use sink::init;

/// Format and emit one line. Prefer the level macros over calling this.
pub fn log(level: LogLevel, args: fmt::Arguments) {
    if !is_enabled(level) {
        return;
    }
    sink::write(format_args!("[{}] {}\n", level.as_str(), args));
}

#[macro_export]
macro_rules! printk {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::log($level, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => { $crate::printk!($crate::log::LogLevel::Error, $($arg)*) };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => { $crate::printk!($crate::log::LogLevel::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => { $crate::printk!($crate::log::LogLevel::Info, $($arg)*) };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => { $crate::printk!($crate::log::LogLevel::Debug, $($arg)*) };
}

#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => { $crate::printk!($crate::log::LogLevel::Trace, $($arg)*) };
}
