//! Logging macros.
//!
//! Forward to `log`, `defmt` or `esp-println` depending on the enabled
//! feature. Without any sink the arguments are still evaluated by reference
//! so call sites never produce unused-variable warnings.

#![allow(unused_macros)]

use core::fmt::{Debug, Formatter, Result};

macro_rules! log_with {
    ($level:ident, $tag:literal, $s:literal $(, $x:expr)* $(,)?) => {
        {
            #[cfg(feature = "log")]
            ::log::$level!($s $(, $x)*);
            #[cfg(feature = "defmt")]
            ::defmt::$level!($s $(, $x)*);
            #[cfg(feature = "esp32-log")]
            ::esp_println::println!(concat!($tag, " - ", $s) $(, $x)*);
            #[cfg(not(any(feature = "log", feature = "defmt", feature = "esp32-log")))]
            let _ = ($( & $x ),*);
        }
    };
}

macro_rules! trace {
    ($s:literal $(, $x:expr)* $(,)?) => { log_with!(trace, "TRACE", $s $(, $x)*) };
}

macro_rules! debug {
    ($s:literal $(, $x:expr)* $(,)?) => { log_with!(debug, "DEBUG", $s $(, $x)*) };
}

macro_rules! info {
    ($s:literal $(, $x:expr)* $(,)?) => { log_with!(info, "INFO", $s $(, $x)*) };
}

macro_rules! warn {
    ($s:literal $(, $x:expr)* $(,)?) => { log_with!(warn, "WARN", $s $(, $x)*) };
}

macro_rules! error {
    ($s:literal $(, $x:expr)* $(,)?) => { log_with!(error, "ERROR", $s $(, $x)*) };
}

/// Logs any `Debug` value, including under `defmt` where it goes through
/// `defmt::Debug2Format`.
pub(crate) struct Dbg<'a, T: ?Sized>(pub &'a T);

impl<T: Debug + ?Sized> Debug for Dbg<'_, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        self.0.fmt(f)
    }
}

#[cfg(feature = "defmt")]
impl<T: Debug + ?Sized> defmt::Format for Dbg<'_, T> {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "{}", defmt::Debug2Format(self.0))
    }
}
