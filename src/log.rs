//! Ambient logging facade.
//!
//! Mirrors the approach used throughout the stack's component layers: when the `log` Cargo
//! feature is enabled, these macros forward to the `log` crate. When it isn't, they expand to
//! `format_args!` so the format string is still type-checked but nothing is emitted and no `log`
//! dependency is pulled in. The actual trace/log sink (where bytes end up: UART, RTT, a file) is
//! external to this crate — this facade only standardizes the call sites.

#[cfg(feature = "log")]
pub(crate) macro_rules! error {
    ($($t:tt)*) => {{ log::error!($($t)*); }};
}

#[cfg(feature = "log")]
pub(crate) macro_rules! warn {
    ($($t:tt)*) => {{ log::warn!($($t)*); }};
}

#[cfg(feature = "log")]
pub(crate) macro_rules! info {
    ($($t:tt)*) => {{ log::info!($($t)*); }};
}

#[cfg(feature = "log")]
pub(crate) macro_rules! debug {
    ($($t:tt)*) => {{ log::debug!($($t)*); }};
}

#[cfg(feature = "log")]
pub(crate) macro_rules! trace {
    ($($t:tt)*) => {{ log::trace!($($t)*); }};
}

#[cfg(not(feature = "log"))]
pub(crate) macro_rules! error {
    ($($t:tt)*) => {{ format_args!($($t)*); }};
}

#[cfg(not(feature = "log"))]
pub(crate) macro_rules! warn {
    ($($t:tt)*) => {{ format_args!($($t)*); }};
}

#[cfg(not(feature = "log"))]
pub(crate) macro_rules! info {
    ($($t:tt)*) => {{ format_args!($($t)*); }};
}

#[cfg(not(feature = "log"))]
pub(crate) macro_rules! debug {
    ($($t:tt)*) => {{ format_args!($($t)*); }};
}

#[cfg(not(feature = "log"))]
pub(crate) macro_rules! trace {
    ($($t:tt)*) => {{ format_args!($($t)*); }};
}
