//! Configuration for Cauldron
//!
//! CLI arguments and environment variable handling using clap.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::time::Duration;

/// Idle timeout applied when none (or a non-positive one) is configured
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Cauldron - session gateway for BoilingData queries
#[derive(Parser, Debug, Clone)]
#[command(name = "cauldron")]
#[command(about = "Turns a persistent query WebSocket into a request/response HTTP service")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8088")]
    pub listen: SocketAddr,

    /// WebSocket URL of the query service
    #[arg(long, env = "WSS_URL")]
    pub wss_url: Option<String>,

    /// AWS region of the identity provider
    #[arg(long, env = "REGION", default_value = "eu-west-1")]
    pub region: String,

    /// Cognito app client id used for sign-in
    #[arg(long, env = "COGNITO_CLIENT_ID")]
    pub cognito_client_id: Option<String>,

    /// Close an idle connection after this many minutes without traffic
    #[arg(long, env = "IDLE_TIMEOUT_MINUTES", default_value = "10")]
    pub idle_timeout_minutes: i64,

    /// Give up on a single query after this many seconds (unset = wait for the connection)
    #[arg(long, env = "QUERY_TIMEOUT_SECS")]
    pub query_timeout_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "pretty")]
    pub log_format: LogFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        match self.wss_url.as_deref() {
            None | Some("") => return Err("WSS_URL is required".to_string()),
            Some(url) if !url.starts_with("ws://") && !url.starts_with("wss://") => {
                return Err(format!("WSS_URL must be a ws:// or wss:// URL, got {}", url));
            }
            _ => {}
        }

        if self.cognito_client_id.as_deref().unwrap_or("").is_empty() {
            return Err("COGNITO_CLIENT_ID is required".to_string());
        }

        Ok(())
    }

    /// Session settings derived from the command line
    pub fn session_config(&self) -> SessionConfig {
        let idle_timeout = if self.idle_timeout_minutes > 0 {
            Some(Duration::from_secs(self.idle_timeout_minutes as u64 * 60))
        } else {
            None
        };

        SessionConfig::new(self.wss_url.clone().unwrap_or_default())
            .with_idle_timeout(idle_timeout)
            .with_query_timeout(self.query_timeout_secs.map(Duration::from_secs))
    }
}

/// Per-session settings shared by every session a registry creates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// WebSocket URL of the query service
    pub url: String,
    /// Connection-wide idle timeout
    pub idle_timeout: Duration,
    /// Optional per-query deadline
    pub query_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8443".to_string(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            query_timeout: None,
        }
    }
}

impl SessionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Replace the default idle timeout; `None` or zero keeps the default.
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = match idle_timeout {
            Some(timeout) if !timeout.is_zero() => timeout,
            _ => DEFAULT_IDLE_TIMEOUT,
        };
        self
    }

    pub fn with_query_timeout(mut self, query_timeout: Option<Duration>) -> Self {
        self.query_timeout = query_timeout;
        self
    }
}
