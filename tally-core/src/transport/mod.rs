//! Delivery of a single event to the collector
//!
//! A [`Transport`] performs exactly one attempt per call and never returns
//! an error: every problem (bad status, connection failure, timeout,
//! unbuildable request) is folded into [`DeliveryOutcome::Failed`] so the
//! queue can decide whether to back off.

mod http;

pub use http::HttpTransport;

use std::future::Future;
use std::pin::Pin;

use crate::event::EventRecord;

/// Result of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The collector acknowledged the event
    Delivered,
    /// The attempt failed; the reason is only used for logging
    Failed(String),
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered)
    }
}

/// Boxed future returned by [`Transport::send`]
pub type SendFuture<'a> = Pin<Box<dyn Future<Output = DeliveryOutcome> + Send + 'a>>;

/// One network delivery attempt for one event
pub trait Transport: Send + Sync {
    fn send<'a>(&'a self, record: &'a EventRecord) -> SendFuture<'a>;
}
