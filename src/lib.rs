//! # EmberKV
//!
//! An in-memory key-value store with:
//! - Lock-striped sharded storage for concurrent writers
//! - A RESP wire protocol with a streaming, resynchronizing decoder
//! - An append-only file (AOF) with `always` / `everysec` / `no` fsync
//! - Startup replay and online AOF rewrite
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TCP Server                             │
//! │               (one thread per connection)                   │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │  RESP multi-bulk requests
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                StandaloneDatabase::exec                     │
//! │               (SELECT, SET, GET, DEL, ...)                  │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐  record   ┌─────────────┐
//!   │ShardedStore │──────────▶│ AofHandler  │
//!   │ (RwLock per │ (shard    │ queue, fsync│
//!   │   shard)    │  locked)  │ replay, BGR │
//!   └─────────────┘           └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;

pub mod aof;
pub mod database;
pub mod engine;
pub mod network;
pub mod protocol;
pub mod store;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{Config, FsyncPolicy};
pub use engine::Engine;
pub use error::{EmberError, Result};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of EmberKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
