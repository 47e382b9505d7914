//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

/// Customized error type for Rookery.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct RookeryError(pub String);

impl RookeryError {
    /// Creates an error from anything that can be displayed.
    pub fn msg(e: impl ToString) -> Self {
        RookeryError(e.to_string())
    }
}

impl fmt::Display for RookeryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl std::error::Error for RookeryError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `RookeryError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for RookeryError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                RookeryError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(std::num::ParseIntError);
impl_from_error!(serde_json::Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::time::error::Elapsed);
impl_from_error!(tokio::sync::watch::error::SendError<bool>);
impl_from_error!(
    tokio::sync::watch::error::SendError<Option<tokio::time::Instant>>
);
