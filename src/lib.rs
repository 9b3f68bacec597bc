//! Cauldron - session gateway for BoilingData queries
//!
//! Holds one persistent WebSocket per signed-in identity and turns it into a
//! request/response query service: queries are multiplexed over the shared
//! connection, multi-part answers are reassembled by request id, and the
//! connection is re-established on demand after an idle close or failure.

pub mod auth;
pub mod config;
pub mod protocol;
pub mod registry;
pub mod routes;
pub mod server;
pub mod session;
pub mod signing;
pub mod types;

pub use config::{Args, SessionConfig};
pub use protocol::{QueryPayload, QueryResult, ResponseFragment};
pub use registry::SessionRegistry;
pub use server::{run, AppState};
pub use session::{ConnectionState, Session};
pub use types::{CauldronError, Result};
