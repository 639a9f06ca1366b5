//! Core types and utilities for the switchboard integration layer.
//!
//! This crate provides the error handling foundation and the identifier
//! types shared by the integration crates.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{EventId, ListenerId, ParseIdError};
