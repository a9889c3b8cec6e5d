//! HTTP API Module
//!
//! Provides a read-only REST API over relay statistics.

mod http;

pub use http::{ClientView, HealthResponse, HttpServer, StatsResponse};
