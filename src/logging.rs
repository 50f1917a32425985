//! Logging abstraction
//!
//! Diagnostic output that works across targets:
//! - `defmt` feature: forwarded to defmt
//! - Host unit tests: printed to stdout
//! - Otherwise: no-op
//!
//! Nothing here reports errors to the application. Outcomes are delivered
//! through transaction callbacks only.

macro_rules! log_emit {
    ($level:ident, $tag:literal, $($arg:tt)*) => {{
        #[cfg(feature = "defmt")]
        ::defmt::$level!($($arg)*);

        #[cfg(all(not(feature = "defmt"), test))]
        println!(concat!("[", $tag, "] {}"), format_args!($($arg)*));

        #[cfg(all(not(feature = "defmt"), not(test)))]
        {
            let _ = format_args!($($arg)*);
        }
    }};
}

/// Log warning message
macro_rules! log_warn {
    ($($arg:tt)*) => {
        log_emit!(warn, "WARN", $($arg)*)
    };
}

/// Log debug message
macro_rules! log_debug {
    ($($arg:tt)*) => {
        log_emit!(debug, "DEBUG", $($arg)*)
    };
}

/// Log trace message
macro_rules! log_trace {
    ($($arg:tt)*) => {
        log_emit!(trace, "TRACE", $($arg)*)
    };
}
