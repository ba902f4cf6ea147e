//! Host process for the Finguard security core.
//!
//! Loads configuration, connects the shared store, and serves a small axum
//! router whose protected routes sit behind the require-auth gate.

pub mod config;
pub mod handlers;
pub mod observability;
pub mod server;

pub use config::AppConfig;
pub use handlers::AppState;
pub use server::{FinguardServer, ServerBuilder, build_app};
