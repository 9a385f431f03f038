//! Unified logging macro.
//!
//! `knx_log!` forwards to the `log` facade when the `log` feature is enabled,
//! to `defmt` when the `defmt` feature is enabled, and compiles to nothing
//! otherwise. Format strings must stay within the subset both backends
//! accept (`{}` and `{:?}`).
//!
//! ```rust,ignore
//! knx_log!(info, "Connected on channel {}", channel_id);
//! knx_log!(debug, "Resending frame, attempt {}/{}", attempt, max);
//! ```

/// Unified logging macro - selects `log::` or `defmt::` based on features.
#[macro_export]
#[cfg(feature = "log")]
macro_rules! knx_log {
    (info, $($arg:tt)*) => { log::info!($($arg)*) };
    (debug, $($arg:tt)*) => { log::debug!($($arg)*) };
    (warn, $($arg:tt)*) => { log::warn!($($arg)*) };
    (error, $($arg:tt)*) => { log::error!($($arg)*) };
    (trace, $($arg:tt)*) => { log::trace!($($arg)*) };
}

#[macro_export]
#[cfg(all(feature = "defmt", not(feature = "log")))]
macro_rules! knx_log {
    (info, $($arg:tt)*) => { defmt::info!($($arg)*) };
    (debug, $($arg:tt)*) => { defmt::debug!($($arg)*) };
    (warn, $($arg:tt)*) => { defmt::warn!($($arg)*) };
    (error, $($arg:tt)*) => { defmt::error!($($arg)*) };
    (trace, $($arg:tt)*) => { defmt::trace!($($arg)*) };
}

#[macro_export]
#[cfg(not(any(feature = "log", feature = "defmt")))]
macro_rules! knx_log {
    ($level:ident, $($arg:tt)*) => {{
        if false {
            let _ = format_args!($($arg)*);
        }
    }};
}
