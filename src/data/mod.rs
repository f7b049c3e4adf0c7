//! Data layer module
//!
//! Handles all data persistence:
//! - SQLite database operations
//! - Entity models and audience tokens

mod database;
mod models;

pub use database::Database;
pub use models::*;
