//! Producer-facing tracker
//!
//! [`Tracker`] is the fire-and-forget front door: every method returns
//! immediately and never reports delivery problems. Events logged before
//! [`Tracker::start`] has completed are dropped.
//!
//! ```rust,no_run
//! use tally_core::{Config, Tracker};
//!
//! # async fn run() -> tally_core::Result<()> {
//! let tracker = Tracker::new();
//! tracker.start(&Config::load()?)?;
//! tracker.in_app_purchase("gold_pack", "order-1");
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::{AppConfig, Config};
use crate::context::{self, ClientContext, SdkKey};
use crate::error::{Error, Result};
use crate::event::{EventRecord, Params};
use crate::queue::{DeliveryQueue, QueueHandle, QueueStatus};
use crate::retry::RetryScheduler;
use crate::store::SqliteStore;
use crate::transport::{HttpTransport, Transport};

// Preference keys
const PREF_USER_ID: &str = "uuid";
const PREF_HARDWARE_ID: &str = "huid";
const PREF_USER_REGISTERED: &str = "user_registered";
const PREF_CUSTOM_USER_ID: &str = "user_id";
const PREF_FIRST_LAUNCH_PARAMS: &str = "first_launch_params";
const PREF_FIRST_LAUNCH_EMPTY: &str = "first_launch_empty";

/// Initialization state token
enum TrackerState {
    Uninitialized,
    Running(Running),
    Stopped,
}

struct Running {
    context: Arc<ClientContext>,
    store: Arc<SqliteStore>,
    queue: QueueHandle,
}

pub struct Tracker {
    state: RwLock<TrackerState>,
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracker {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(TrackerState::Uninitialized),
        }
    }

    /// Open the store, load or create the device identity and start the
    /// delivery queue. Must be called from within a Tokio runtime.
    ///
    /// Only the first call has any effect.
    pub fn start(&self, config: &Config) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        if !matches!(*state, TrackerState::Uninitialized) {
            tracing::info!("Tracker already started, ignoring start");
            return Ok(());
        }

        config.app.validate()?;
        let key = SdkKey::parse(config.app.sdk_key.as_deref().unwrap_or_default())?;

        let store = SqliteStore::open(&Config::database_path())?;
        store.run_migrations()?;
        let store = Arc::new(store);

        let (user_id, hardware_id) = load_identity(&store, &config.app)?;
        let context = ClientContext::new(
            &key,
            user_id,
            hardware_id,
            config.app.bundle_id.clone(),
            config.app.app_version.clone(),
        );
        let transport = Arc::new(HttpTransport::new(&config.collector)?);

        *state = TrackerState::Running(Self::launch(
            context,
            store,
            transport,
            RetryScheduler::from_config(&config.collector),
            config.collector.attempt_timeout(),
        ));

        tracing::info!(
            bundle_id = %config.app.bundle_id,
            endpoint = %config.collector.endpoint,
            "Tracker started"
        );
        Ok(())
    }

    /// Start with caller-supplied parts. Only the first call has any effect.
    pub fn start_with(
        &self,
        context: ClientContext,
        store: Arc<SqliteStore>,
        transport: Arc<dyn Transport>,
        retry: RetryScheduler,
        attempt_timeout: Duration,
    ) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        if !matches!(*state, TrackerState::Uninitialized) {
            tracing::info!("Tracker already started, ignoring start");
            return Ok(());
        }

        store.run_migrations()?;
        *state = TrackerState::Running(Self::launch(
            context,
            store,
            transport,
            retry,
            attempt_timeout,
        ));
        Ok(())
    }

    fn launch(
        context: ClientContext,
        store: Arc<SqliteStore>,
        transport: Arc<dyn Transport>,
        retry: RetryScheduler,
        attempt_timeout: Duration,
    ) -> Running {
        let context = Arc::new(context);
        let queue = DeliveryQueue::new(context.clone(), store.clone(), transport)
            .with_retry(retry)
            .with_attempt_timeout(attempt_timeout)
            .spawn();
        Running {
            context,
            store,
            queue,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(
            *self.state.read().unwrap_or_else(|p| p.into_inner()),
            TrackerState::Running(_)
        )
    }

    /// The context events are signed with, once started
    pub fn context(&self) -> Option<Arc<ClientContext>> {
        self.with_running(|running| running.context.clone())
    }

    /// Log an arbitrary event.
    ///
    /// Names rejected by [`check_event_name`] are dropped with a warning.
    pub fn log_event(&self, name: &str, params: Params, post_data: Option<String>) {
        if let Err(e) = check_event_name(name) {
            tracing::warn!(event = name, error = %e, "Dropping invalid event");
            return;
        }

        let logged = self.with_running(|running| {
            match EventRecord::create(name, params, post_data, &running.context) {
                Ok(record) => running.queue.enqueue(record),
                Err(e) => tracing::warn!(event = name, error = %e, "Dropping invalid event"),
            }
        });
        if logged.is_none() {
            tracing::debug!(event = name, "Tracker not started, dropping event");
        }
    }

    // ============================================
    // Standard events
    // ============================================

    /// Mark this user as newly registered. Reported once per install.
    pub fn user_registered(&self) {
        if self.claim_once(PREF_USER_REGISTERED) {
            self.log_event("UserRegistered", Params::new(), None);
        } else {
            tracing::debug!("User already marked as registered");
        }
    }

    /// Log a completed in-app purchase.
    pub fn in_app_purchase(&self, product_id: &str, order_id: &str) {
        self.log_purchase(product_id, order_id, false);
    }

    /// Log a refunded in-app purchase.
    pub fn in_app_purchase_refunded(&self, product_id: &str, order_id: &str) {
        self.log_purchase(product_id, order_id, true);
    }

    fn log_purchase(&self, product_id: &str, order_id: &str, refund: bool) {
        let params = params_of([
            ("productID", product_id.to_string()),
            ("orderID", order_id.to_string()),
            ("quantity", if refund { "-1" } else { "1" }.to_string()),
        ]);
        self.log_event("InAppPurchase", params, None);
    }

    /// Log a purchase made outside the store, priced in an ISO 4217 currency.
    pub fn external_purchase(&self, product_id: &str, currency: &str, price: f64, quantity: i32) {
        let params = params_of([
            ("productID", product_id.to_string()),
            ("currency", currency.to_string()),
            ("price", format_price(price)),
            ("quantity", quantity.to_string()),
        ]);
        self.log_event("ExternalPurchase", params, None);
    }

    /// Log a banner click.
    pub fn banner_click(&self, publisher: Option<&str>) {
        let mut params = Params::new();
        if let Some(publisher) = publisher {
            params.insert("publisher".to_string(), publisher.to_string());
        }
        self.log_event("BannerClick", params, None);
    }

    /// Attach an application-defined user id. Empty or unchanged ids are ignored.
    pub fn set_user_id(&self, user_id: &str) {
        if user_id.is_empty() {
            return;
        }

        let changed = self.with_running(|running| {
            match running.store.get_preference(PREF_CUSTOM_USER_ID) {
                Ok(Some(stored)) if stored == user_id => false,
                Ok(_) => {
                    if let Err(e) = running.store.set_preference(PREF_CUSTOM_USER_ID, user_id) {
                        tracing::warn!(error = %e, "Failed to persist user id");
                    }
                    true
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read stored user id");
                    true
                }
            }
        });

        match changed {
            Some(true) => {
                self.log_event("UserID", params_of([("id", user_id.to_string())]), None)
            }
            Some(false) => tracing::debug!(user_id, "User id unchanged"),
            None => tracing::debug!("Tracker not started, dropping user id"),
        }
    }

    /// Report the first launch of this install.
    ///
    /// `referrer` is the install referrer query (`k=v&k2=v2`). A launch with
    /// referrer parameters is reported once; an organic launch without them
    /// is reported once as well, unless parameters were already reported.
    pub fn first_launch(&self, referrer: Option<&str>) {
        let params = referrer.map(parse_referrer).unwrap_or_default();

        let claimed = self.with_running(|running| {
            if running.store.get_flag(PREF_FIRST_LAUNCH_PARAMS).unwrap_or(false) {
                return false;
            }
            let key = if params.is_empty() {
                PREF_FIRST_LAUNCH_EMPTY
            } else {
                PREF_FIRST_LAUNCH_PARAMS
            };
            claim_flag(&running.store, key)
        });

        match claimed {
            Some(true) => self.log_event("FirstLaunch", params, None),
            Some(false) => tracing::debug!("First launch already reported"),
            None => tracing::debug!("Tracker not started, dropping first launch"),
        }
    }

    // ============================================
    // Lifecycle
    // ============================================

    /// Queue snapshot, if running
    pub async fn status(&self) -> Option<QueueStatus> {
        let queue = self.with_running(|running| running.queue.clone())?;
        queue.status().await.ok()
    }

    /// Wait up to `timeout` for the queue to become idle.
    pub async fn drain(&self, timeout: Duration) -> Option<QueueStatus> {
        let queue = self.with_running(|running| running.queue.clone())?;
        queue.drain(timeout).await.ok()
    }

    /// Stop the queue. Later events are dropped; undelivered ones stay stored.
    pub async fn shutdown(&self) {
        let previous = {
            let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
            std::mem::replace(&mut *state, TrackerState::Stopped)
        };
        if let TrackerState::Running(running) = previous {
            if let Err(e) = running.queue.shutdown().await {
                tracing::debug!(error = %e, "Queue already closed");
            }
        }
    }

    fn with_running<R>(&self, f: impl FnOnce(&Running) -> R) -> Option<R> {
        let state = self.state.read().unwrap_or_else(|p| p.into_inner());
        match &*state {
            TrackerState::Running(running) => Some(f(running)),
            _ => None,
        }
    }

    /// Set `key` and report whether this call was the one that set it.
    fn claim_once(&self, key: &str) -> bool {
        self.with_running(|running| claim_flag(&running.store, key))
            .unwrap_or(false)
    }
}

/// Atomically claim a one-shot flag. A store failure counts as claimed so
/// the event is still reported.
fn claim_flag(store: &SqliteStore, key: &str) -> bool {
    store.claim_flag(key).unwrap_or_else(|e| {
        tracing::warn!(key, error = %e, "Failed to claim flag");
        true
    })
}

/// Event names go into the query unencoded, so they must be non-empty and
/// free of query delimiters.
pub fn check_event_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidEvent("event name must not be empty".to_string()));
    }
    if let Some(c) = name.chars().find(|c| matches!(c, '&' | '#' | '?' | '=')) {
        return Err(Error::InvalidEvent(format!(
            "event name must not contain '{}'",
            c
        )));
    }
    Ok(())
}

/// Load the persisted user id and derive the hardware id, creating and
/// storing them on first use.
fn load_identity(store: &SqliteStore, app: &AppConfig) -> Result<(String, String)> {
    let user_id = match store.get_preference(PREF_USER_ID)? {
        Some(id) => id,
        None => {
            let id = context::generate_user_id();
            store.set_preference(PREF_USER_ID, &id)?;
            id
        }
    };

    let hardware_id = match &app.hardware_seed {
        Some(seed) => context::hardware_id_from_seed(seed),
        None => store
            .get_preference(PREF_HARDWARE_ID)?
            .unwrap_or_else(context::random_hardware_id),
    };
    store.set_preference(PREF_HARDWARE_ID, &hardware_id)?;

    Ok((user_id, hardware_id))
}

fn params_of<const N: usize>(pairs: [(&str, String); N]) -> Params {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

/// Whole prices keep one decimal (`5.0`), others print as-is (`4.99`).
fn format_price(price: f64) -> String {
    if price.is_finite() && price.fract() == 0.0 {
        format!("{:.1}", price)
    } else {
        price.to_string()
    }
}

/// Parse an install referrer query string into parameters.
fn parse_referrer(referrer: &str) -> Params {
    referrer
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = urlencoding::decode(key).ok()?.into_owned();
            if key.is_empty() {
                return None;
            }
            let value = urlencoding::decode(value).ok()?.into_owned();
            Some((key, value))
        })
        .collect()
}
