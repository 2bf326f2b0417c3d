//! # tally-core
//!
//! Durable, ordered delivery of signed analytics events.
//!
//! This library provides:
//! - Event records with a keyed MD5 checksum chain
//! - SQLite persistence so undelivered events survive restarts
//! - A single-task delivery queue with exponential backoff
//! - A fire-and-forget [`Tracker`] facade for producers
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! An event flows through three stages:
//! - **Record:** built and checksummed once, from a [`ClientContext`]
//! - **Store:** appended to SQLite before delivery is attempted
//! - **Queue:** delivered head-first, removed from the store only on success
//!
//! ## Example
//!
//! ```rust,no_run
//! use tally_core::{Config, Params, Tracker};
//!
//! # async fn run() -> tally_core::Result<()> {
//! let config = Config::load()?;
//! let tracker = Tracker::new();
//! tracker.start(&config)?;
//!
//! let mut params = Params::new();
//! params.insert("level".to_string(), "3".to_string());
//! tracker.log_event("LevelComplete", params, None);
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use context::{ClientContext, SdkKey};
pub use error::{Error, Result};
pub use event::{EventRecord, Params};
pub use queue::{DeliveryQueue, QueueHandle, QueueState, QueueStatus};
pub use retry::RetryScheduler;
pub use store::{EventStore, SqliteStore};
pub use tracker::Tracker;
pub use transport::{DeliveryOutcome, HttpTransport, Transport};

// Public modules
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod logging;
pub mod queue;
pub mod retry;
pub mod store;
pub mod tracker;
pub mod transport;
