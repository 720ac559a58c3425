//! In-memory storage implementations
//!
//! This module provides an in-memory implementation of the client storage traits.
//! It is suitable for development and testing.

mod clients;

pub use clients::{MemoryClientStore, MemoryClientTransaction};
