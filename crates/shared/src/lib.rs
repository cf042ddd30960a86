#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Lectern Shared Types and Utilities
//!
//! This crate contains identifiers, enums, errors, and database helpers shared
//! by the quota ledger and the background worker.

pub mod db;
pub mod error;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
