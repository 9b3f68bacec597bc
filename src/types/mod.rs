//! Shared types for Cauldron

pub mod error;

pub use error::{CauldronError, Result};
