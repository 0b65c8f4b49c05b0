#![forbid(unsafe_code)]

//! Bridge between a host application and agent CLIs.
//!
//! The host speaks NDJSON JSON-RPC over stdio or a local socket ([`rpc`],
//! [`transport`]). Queries are routed by agent type ([`server`]) to an
//! orchestrator that drives the matching CLI ([`orchestrator`], [`backend`])
//! and streams its output back as uniform events.

pub mod backend;
pub mod config;
pub mod errors;
pub mod orchestrator;
pub mod rpc;
pub mod server;
pub mod transport;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
