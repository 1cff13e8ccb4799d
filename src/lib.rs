//! grove library crate
//!
//! Cache-first analysis service: profile versioning, a local analysis cache,
//! the Anthropic inference gateway with prompt caching, cost accounting, and
//! the client retry controller that talks to the HTTP server.

pub mod api;
pub mod cache;
pub mod client;
pub mod config;
pub mod cost;
pub mod diagnostics;
pub mod error;
pub mod gateway;
pub mod item;
pub mod keyring;
pub mod ledger;
pub mod models;
pub mod orchestrator;
pub mod profile;
pub mod server;
pub mod util;
