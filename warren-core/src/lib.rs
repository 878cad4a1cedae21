//! Warren Core - Foundation types and errors
//!
//! This crate provides the error taxonomy and the strong types shared by the
//! rootless network namespace manager and its command-line front end.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod types;

pub use error::{Error, MultiError, Result, WrapErr};
pub use types::{NetworkInfo, ProcessId};
