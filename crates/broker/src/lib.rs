//! HTTP surface of the `tokenbroker` streaming LLM request broker: routing,
//! middleware and dashboard endpoints over the `tokenbroker-engine` dispatch
//! core.

pub mod auth;
pub mod cli;
pub mod config;
pub mod middleware;
pub mod once;
pub mod server;
pub mod shutdown;
