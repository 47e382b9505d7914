//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod timer;
mod wire;

pub use error::RookeryError;
pub use timer::Timer;
pub use wire::{
    read_frame, read_frame_raw, tcp_bind_with_retry, write_frame,
    write_frame_raw,
};
