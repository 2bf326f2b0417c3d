//! Durable storage for pending events
//!
//! The [`EventStore`] trait is the queue's view of persistence. The SQLite
//! implementation keeps two tables:
//! - `events`: one row per pending event
//! - `event_params`: zero or more key/value rows per event
//!
//! Both are written and deleted together inside a single transaction.

pub mod schema;
pub mod sqlite;

pub use sqlite::{SqliteStore, StoredEvent};

use crate::context::ClientContext;
use crate::error::Result;
use crate::event::EventRecord;

/// Transactional persistence for pending events
pub trait EventStore: Send + Sync {
    /// Insert an event and its parameters atomically, returning the new id.
    fn append(&self, record: &EventRecord) -> Result<i64>;

    /// Delete an event and its parameters atomically.
    fn remove(&self, id: i64) -> Result<()>;

    /// All pending events, oldest first.
    fn load_all(&self, ctx: &ClientContext) -> Result<Vec<EventRecord>>;

    /// Apply the schema steps in `(old_version, new_version]`.
    fn migrate(&self, old_version: i32, new_version: i32) -> Result<()>;

    /// Number of stored pending events.
    fn pending_count(&self) -> Result<usize>;
}
