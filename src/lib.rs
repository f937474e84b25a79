//! e4s-index: a multi-tenant time-series existence index.
//!
//! Answers "does entity E have data at time T, at granularity G?" at high
//! rates, along with navigation to the nearest marked time before or after
//! T. Presence is tracked in compressed per-partition bitmaps, cached hot
//! in-process, written behind to a fast store, and optionally persisted to
//! PostgreSQL as the source of truth.

pub mod bitset;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod kv;
pub mod locks;
pub mod logging;
pub mod partition;
pub mod reindex;
pub mod repository;
pub mod server;
pub mod time;
pub mod validation;

pub use engine::{EngineOptions, IndexEngine, IndexStats};
pub use error::{IndexError, Result};
pub use time::Granularity;
