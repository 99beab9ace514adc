#![cfg_attr(not(feature = "std"), no_std)]

// must stay first so the logging macros are visible in every module below
#[macro_use]
mod fmt;

pub mod board;
pub mod can;
pub mod checksum;
pub mod config;
pub mod diagnostics;
pub mod downlink;
pub mod error_channel;
pub mod fdir;
pub mod ids;
pub mod mode;
pub mod router;
pub mod spimem;
pub mod sync;

#[cfg(feature = "std")]
pub mod sim;
