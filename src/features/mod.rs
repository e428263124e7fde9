//! Feature implementations for fieldsync.
//!
//! This module contains:
//! - The offline sync queue engine
//! - The offline read cache for field data

pub mod cache;
pub mod sync;
