#![no_std]

extern crate alloc;

use alloc::sync::Arc;
use core::fmt::{self, Write};

use spinlock::Spin;

/// A sink the kernel can print to. Implemented by the serial/framebuffer
/// console drivers, which live outside this core (see SPEC_FULL.md §1).
pub trait ConsoleWrite: Send + Sync {
    fn write(&self, s: &str);
}

struct Console {
    sink: Option<Arc<dyn ConsoleWrite>>,
}

impl Console {
    const fn new() -> Self {
        Self { sink: None }
    }
}

impl Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if let Some(sink) = self.sink.as_ref() {
            sink.write(s);
        }
        Ok(())
    }
}

static CONSOLE: Spin<Console> = Spin::new(Console::new());

pub fn set_console(sink: Arc<dyn ConsoleWrite>) {
    CONSOLE.lock().sink = Some(sink);
}

#[doc(hidden)]
pub fn do_print(args: fmt::Arguments) {
    let _ = CONSOLE.lock().write_fmt(args);
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::do_print(::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => { $crate::print!("\n") };
    ($($arg:tt)*) => {
        $crate::do_print(::core::format_args!("{}\n", ::core::format_args!($($arg)*)))
    };
}

#[macro_export]
macro_rules! println_fatal {
    ($($arg:tt)*) => { $crate::println!("[FATAL] {}", ::core::format_args!($($arg)*)) };
}

#[macro_export]
macro_rules! println_warn {
    ($($arg:tt)*) => { $crate::println!("[WARN] {}", ::core::format_args!($($arg)*)) };
}

#[macro_export]
macro_rules! println_info {
    ($($arg:tt)*) => { $crate::println!("[INFO] {}", ::core::format_args!($($arg)*)) };
}

#[cfg(feature = "log_debug")]
#[macro_export]
macro_rules! println_debug {
    ($($arg:tt)*) => { $crate::println!("[DEBUG] {}", ::core::format_args!($($arg)*)) };
}

#[cfg(not(feature = "log_debug"))]
#[macro_export]
macro_rules! println_debug {
    ($($arg:tt)*) => {{}};
}

#[cfg(feature = "log_trace")]
#[macro_export]
macro_rules! println_trace {
    ($($arg:tt)*) => { $crate::println!("[TRACE] {}", ::core::format_args!($($arg)*)) };
}

#[cfg(not(feature = "log_trace"))]
#[macro_export]
macro_rules! println_trace {
    ($($arg:tt)*) => {{}};
}
