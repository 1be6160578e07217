//! Utility functions.

pub mod env;
pub mod ident;
pub mod time;

pub use ident::escape_identifier;
pub use time::Timestamp;
