//! API layer
//!
//! Thin HTTP glue over the core services:
//! - Outbox dispatch
//! - Federation pull and job visibility
//! - Timelines
//! - Well-known instance descriptor
//! - Metrics (Prometheus)

mod routes;

pub use routes::api_router;
