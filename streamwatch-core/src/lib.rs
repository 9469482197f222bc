//! # streamwatch-core
//!
//! Core library for streamwatch - a media server activity monitor.
//!
//! This library provides:
//! - Protocol clients for Plex, Jellyfin, Emby, Audiobookshelf, and a
//!   generic fallback
//! - Collectors that normalize push/poll backends into one event shape
//! - The Plex session state machine (pause accounting, stale timers,
//!   short-session suppression)
//! - An orchestrator that reconciles collectors against the server registry
//! - An ingestion service persisting sessions and snapshots to SQLite
//! - Query consolidation of reconnect-fragmented sessions and maintenance
//!   (retention, stale sweep, startup recovery)
//!
//! ## Architecture
//!
//! ```text
//! registry ─► Orchestrator ─► Collectors ─► bounded channel ─► IngestService
//!                                │                                   │
//!                       (Plex) SessionManager              activity_sessions
//!                                                          activity_snapshots
//!                                                                   │
//!                                       QueryService / MaintenanceService
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use streamwatch_core::{Config, Database};
//!
//! // Load configuration
//! let config = Config::load().expect("failed to load config");
//!
//! // Open database
//! let db = Database::open(&config.database_path()).expect("failed to open database");
//! db.migrate().expect("failed to run migrations");
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use db::{ActivityFilter, Database, ServerActivity, SortField};
pub use error::{Error, Result};
pub use ingest::IngestService;
pub use maintenance::{MaintenanceService, RecoveryReport};
pub use orchestrator::Orchestrator;
pub use query::{ActivityPage, ConsolidatedSession, QueryService};
pub use registry::ServerRegistry;
pub use types::*;

// Public modules
pub mod clients;
pub mod collector;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod maintenance;
pub mod orchestrator;
pub mod query;
pub mod registry;
pub mod types;
