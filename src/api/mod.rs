//! HTTP API Module
//!
//! Read-only status surface for operators and routers, plus the single
//! admin route for requesting a manual failover.

mod http;

pub use http::{AppState, HttpServer};
