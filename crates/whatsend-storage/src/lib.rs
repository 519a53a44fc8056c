//! Whatsend Storage - Campaign and message state persistence
//!
//! This crate provides the repository interfaces the dispatcher works
//! against, their PostgreSQL implementations, and an in-memory store.

pub mod db;
pub mod memory;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use memory::MemoryStore;
pub use models::*;
pub use repository::*;
