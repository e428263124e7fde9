//! fieldsync - offline sync queue for field operators
//!
//! This crate lets a field client keep recording inspections, field
//! operations and entity edits without connectivity, then delivers every
//! queued mutation to the farm-management API once a connection returns.

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod error;
pub mod features;
pub mod output;
pub mod storage;

pub use cli::args::{Cli, Commands, OutputFormat};
pub use error::FieldsyncError;
pub use features::sync::{EnqueueOptions, Operation, SyncEngine, SyncEvent};
