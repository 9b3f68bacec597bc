//! HTTP front end for Cauldron

pub mod http;

pub use http::{run, serve, AppState};
