//! Media server registry access
//!
//! The registry is durable state owned by the surrounding application; the
//! monitoring engine only reads it. The trait keeps the orchestrator and
//! maintenance services decoupled from the storage layer (and lets tests
//! substitute an in-memory registry).

use crate::db::Database;
use crate::error::Result;
use crate::types::MediaServer;

/// Read-only view of the configured media servers.
pub trait ServerRegistry: Send + Sync {
    /// Servers eligible for monitoring.
    fn list_verified(&self) -> Result<Vec<MediaServer>>;

    /// Look up one server by id.
    fn get(&self, id: i64) -> Result<Option<MediaServer>>;
}

impl ServerRegistry for Database {
    fn list_verified(&self) -> Result<Vec<MediaServer>> {
        self.list_verified_servers()
    }

    fn get(&self, id: i64) -> Result<Option<MediaServer>> {
        self.get_server(id)
    }
}
