//! Mailflow Storage - Database models and repositories
//!
//! This crate provides the Postgres persistence layer for mailflow:
//! connection pooling, the data model, per-aggregate repositories, and
//! at-rest encryption of webhook credentials.

pub mod crypto;
pub mod db;
pub mod models;
pub mod repository;

pub use crypto::SecretCipher;
pub use db::DatabasePool;
pub use models::*;
pub use repository::*;
