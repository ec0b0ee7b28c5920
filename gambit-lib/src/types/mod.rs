#![allow(unreachable_pub)]

mod client_id;
mod error;

pub use client_id::ClientId;
pub use error::ErrorKind;

/// The gambit `Result` type
pub type Result<T> = std::result::Result<T, crate::ErrorKind>;
