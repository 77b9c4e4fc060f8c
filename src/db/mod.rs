//! SQLite persistence.
//!
//! This module provides:
//! - Database initialization and schema migration
//! - SQLite pragma configuration
//! - `Repository`, implementing every repository trait over one pool

pub mod migrations;
pub mod repo;

pub use migrations::init_db;
pub use repo::Repository;
