//! Beamgate - CSRF-guarded proxy for short-lived Hyperbeam browser sessions.

pub mod config;
pub mod csrf;
pub mod error;
pub mod http_server;
pub mod lifecycle;
pub mod provider;
pub mod rate_limit;
pub mod registry;
pub mod state;
pub mod testing;
