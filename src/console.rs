// Console output for the exec subsystem.
// The kernel registers its console write routine once at boot; until then
// (and in unit tests) output is silently dropped.

use core::fmt::{self, Write};
use spin::Mutex;

static SINK: Mutex<Option<fn(&str)>> = Mutex::new(None);

/// Register the kernel's console write routine.
pub fn set_sink(sink: fn(&str)) {
    *SINK.lock() = Some(sink);
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    let mut line: heapless::String<256> = heapless::String::new();
    // Overlong lines are truncated, not dropped.
    let _ = line.write_fmt(args);
    if let Some(sink) = *SINK.lock() {
        sink(line.as_str());
    }
}

#[macro_export]
macro_rules! console_println {
    () => {
        $crate::console::_print(format_args!("\n"))
    };
    ($($arg:tt)*) => {{
        $crate::console::_print(format_args!($($arg)*));
        $crate::console::_print(format_args!("\n"));
    }};
}
