//! Helper macros for logging (console printing).

/// Log TRACE message.
#[macro_export]
macro_rules! pf_trace {
    ($fmt_str:literal) => {
        log::trace!($fmt_str)
    };

    ($fmt_str:literal, $($fmt_arg:tt)*) => {
        log::trace!($fmt_str, $($fmt_arg)*)
    };
}

/// Log DEBUG message.
#[macro_export]
macro_rules! pf_debug {
    ($fmt_str:literal) => {
        log::debug!($fmt_str)
    };

    ($fmt_str:literal, $($fmt_arg:tt)*) => {
        log::debug!($fmt_str, $($fmt_arg)*)
    };
}

/// Log INFO message.
#[macro_export]
macro_rules! pf_info {
    ($fmt_str:literal) => {
        log::info!($fmt_str)
    };

    ($fmt_str:literal, $($fmt_arg:tt)*) => {
        log::info!($fmt_str, $($fmt_arg)*)
    };
}

/// Log WARN message.
#[macro_export]
macro_rules! pf_warn {
    ($fmt_str:literal) => {
        log::warn!($fmt_str)
    };

    ($fmt_str:literal, $($fmt_arg:tt)*) => {
        log::warn!($fmt_str, $($fmt_arg)*)
    };
}

/// Log ERROR message.
#[macro_export]
macro_rules! pf_error {
    ($fmt_str:literal) => {
        log::error!($fmt_str)
    };

    ($fmt_str:literal, $($fmt_arg:tt)*) => {
        log::error!($fmt_str, $($fmt_arg)*)
    };
}

/// Log an error string to logger and then return a `RookeryError`
/// containing the string, wrapped in `Err()`.
///
/// Example:
/// ```no_run
/// # use rookery::{logged_err, pf_error};
/// # use rookery::utils::RookeryError;
/// # fn doctest(msg: &str) -> Result<(), RookeryError> {
/// return logged_err!("got {} to print", msg);
/// # }
/// ```
#[macro_export]
macro_rules! logged_err {
    ($fmt_str:literal) => {{
        pf_error!($fmt_str);
        Err($crate::utils::RookeryError::msg($fmt_str))
    }};

    ($fmt_str:literal, $($fmt_arg:tt)*) => {{
        pf_error!($fmt_str, $($fmt_arg)*);
        Err($crate::utils::RookeryError::msg(format!(
            $fmt_str,
            $($fmt_arg)*
        )))
    }};
}
