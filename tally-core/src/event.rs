//! Analytics event records
//!
//! An [`EventRecord`] is one immutable analytics fact. Its checksum is
//! computed once at creation and binds the wire payload to the secret
//! half of the SDK key:
//!
//! ```text
//! digest  = md5(payload_string)
//! payload = md5(digest + md5(post_data))   if post data is present
//!         = digest                         otherwise
//! checksum = md5(payload + private_key)
//! ```
//!
//! Parameters are kept in a `BTreeMap`, so `ep=` is always serialized in
//! ascending key order and the checksum is reproducible on any platform.

use std::collections::BTreeMap;

use md5::{Digest, Md5};

use crate::context::ClientContext;
use crate::error::{Error, Result};

/// Event parameters, ordered by key
pub type Params = BTreeMap<String, String>;

/// One pending analytics event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    id: Option<i64>,
    name: String,
    params: Params,
    post_data: Option<String>,
    timestamp: i64,
    bundle_id: String,
    app_version: String,
    sdk_version: String,
    payload: String,
    checksum: String,
}

impl EventRecord {
    /// Create a new event stamped with the current time.
    pub fn create(
        name: impl Into<String>,
        params: Params,
        post_data: Option<String>,
        ctx: &ClientContext,
    ) -> Result<Self> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        Self::create_at(name, params, post_data, timestamp, ctx)
    }

    /// Create a new event with an explicit capture time (epoch millis).
    pub fn create_at(
        name: impl Into<String>,
        params: Params,
        post_data: Option<String>,
        timestamp: i64,
        ctx: &ClientContext,
    ) -> Result<Self> {
        Self::build(
            None,
            name.into(),
            params,
            post_data,
            timestamp,
            ctx.bundle_id.clone(),
            ctx.app_version.clone(),
            ctx.sdk_version.clone(),
            ctx,
        )
    }

    /// Rebuild a stored event with its original capture time and
    /// application snapshot.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: i64,
        name: String,
        params: Params,
        post_data: Option<String>,
        timestamp: i64,
        bundle_id: String,
        app_version: String,
        sdk_version: String,
        ctx: &ClientContext,
    ) -> Result<Self> {
        Self::build(
            Some(id),
            name,
            params,
            post_data,
            timestamp,
            bundle_id,
            app_version,
            sdk_version,
            ctx,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        id: Option<i64>,
        name: String,
        params: Params,
        post_data: Option<String>,
        timestamp: i64,
        bundle_id: String,
        app_version: String,
        sdk_version: String,
        ctx: &ClientContext,
    ) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::InvalidEvent("event name must not be empty".to_string()));
        }

        let mut record = Self {
            id,
            name,
            params,
            post_data,
            timestamp,
            bundle_id,
            app_version,
            sdk_version,
            payload: String::new(),
            checksum: String::new(),
        };
        record.payload = record.payload_string(ctx);
        record.checksum = record.compute_checksum(&ctx.private_key);
        Ok(record)
    }

    /// Store-assigned id, `None` until persisted
    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn post_data(&self) -> Option<&str> {
        self.post_data.as_deref()
    }

    /// Capture time in epoch milliseconds
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn bundle_id(&self) -> &str {
        &self.bundle_id
    }

    pub fn app_version(&self) -> &str {
        &self.app_version
    }

    pub fn sdk_version(&self) -> &str {
        &self.sdk_version
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// The signed query payload, without the send-time suffix
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Full request query: payload plus send time and checksum.
    pub fn query_string(&self, send_time_ms: i64) -> String {
        format!("{}&ct={}&cs={}", self.payload, send_time_ms, self.checksum)
    }

    /// Record the id assigned by the store. Only the first assignment sticks.
    pub(crate) fn assign_id(&mut self, id: i64) {
        if self.id.is_none() {
            self.id = Some(id);
        }
    }

    fn payload_string(&self, ctx: &ClientContext) -> String {
        let mut payload = format!(
            "en={}&lt={}&av={}&sv={}&bu={}&oi={}&uu={}&hu={}&es=a",
            self.name,
            self.timestamp,
            self.app_version,
            self.sdk_version,
            self.bundle_id,
            ctx.public_key,
            ctx.unique_user_id,
            ctx.unique_hardware_id,
        );

        if !self.params.is_empty() {
            payload.push_str("&ep=");
            payload.push_str(&urlencoding::encode(&parameter_string(&self.params)));
        }

        payload
    }

    fn compute_checksum(&self, private_key: &str) -> String {
        let digest = md5_hex(&self.payload);
        let payload = match &self.post_data {
            Some(post_data) => md5_hex(&format!("{}{}", digest, md5_hex(post_data))),
            None => digest,
        };
        md5_hex(&format!("{}{}", payload, private_key))
    }
}

/// `key=value` pairs joined with `;`, each side percent-encoded.
fn parameter_string(params: &Params) -> String {
    params
        .iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                urlencoding::encode(key),
                urlencoding::encode(value)
            )
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// MD5 digest as 32 lowercase hex characters
pub fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SdkKey;

    fn fixed_context() -> ClientContext {
        let key = SdkKey::parse("pubKprivK").unwrap();
        ClientContext::new(&key, "UU1", "HU1", "com.example", "1.0").with_sdk_version("2.6")
    }

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_md5_hex() {
        assert_eq!(md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex("abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_payload_string_matches_wire_format() {
        let ctx = fixed_context();
        let event =
            EventRecord::create_at("Test", params(&[("k", "v")]), None, 1000, &ctx).unwrap();

        assert_eq!(
            event.payload(),
            "en=Test&lt=1000&av=1.0&sv=2.6&bu=com.example&oi=pubK&uu=UU1&hu=HU1&es=a&ep=k%3Dv"
        );

        let expected = md5_hex(&format!("{}privK", md5_hex(event.payload())));
        assert_eq!(event.checksum(), expected);
        assert_eq!(event.checksum().len(), 32);
    }

    #[test]
    fn test_no_params_omits_ep() {
        let ctx = fixed_context();
        let event = EventRecord::create_at("Launch", Params::new(), None, 5, &ctx).unwrap();
        assert!(!event.payload().contains("&ep="));
        assert!(event.payload().ends_with("&es=a"));
    }

    #[test]
    fn test_post_data_changes_checksum_chain() {
        let ctx = fixed_context();
        let get = EventRecord::create_at("Post", Params::new(), None, 7, &ctx).unwrap();
        let post = EventRecord::create_at(
            "Post",
            Params::new(),
            Some("{\"a\":1}".to_string()),
            7,
            &ctx,
        )
        .unwrap();

        assert_eq!(get.payload(), post.payload());
        assert_ne!(get.checksum(), post.checksum());

        let digest = md5_hex(post.payload());
        let chained = md5_hex(&format!("{}{}", digest, md5_hex("{\"a\":1}")));
        assert_eq!(post.checksum(), md5_hex(&format!("{}privK", chained)));
    }

    #[test]
    fn test_params_are_key_ordered_and_double_encoded() {
        let ctx = fixed_context();
        let event = EventRecord::create_at(
            "Purchase",
            params(&[("quantity", "1"), ("productID", "a b"), ("orderID", "x;y")]),
            None,
            1,
            &ctx,
        )
        .unwrap();

        // orderID=x%3By;productID=a%20b;quantity=1, then encoded again
        assert!(event.payload().ends_with(
            "&ep=orderID%3Dx%253By%3BproductID%3Da%2520b%3Bquantity%3D1"
        ));
    }

    #[test]
    fn test_checksum_is_deterministic() {
        let ctx = fixed_context();
        let p = params(&[("b", "2"), ("a", "1")]);
        let first = EventRecord::create_at("E", p.clone(), None, 42, &ctx).unwrap();
        let second = EventRecord::create_at("E", p, None, 42, &ctx).unwrap();
        assert_eq!(first.checksum(), second.checksum());
    }

    #[test]
    fn test_checksum_depends_on_secret() {
        let ctx = fixed_context();
        let other_key = SdkKey::parse("pubKother").unwrap();
        let other = ClientContext::new(&other_key, "UU1", "HU1", "com.example", "1.0");

        let a = EventRecord::create_at("E", Params::new(), None, 42, &ctx).unwrap();
        let b = EventRecord::create_at("E", Params::new(), None, 42, &other).unwrap();
        assert_eq!(a.payload(), b.payload());
        assert_ne!(a.checksum(), b.checksum());
    }

    #[test]
    fn test_query_string_appends_send_time_and_checksum() {
        let ctx = fixed_context();
        let event = EventRecord::create_at("E", Params::new(), None, 42, &ctx).unwrap();
        let query = event.query_string(99);
        assert_eq!(
            query,
            format!("{}&ct=99&cs={}", event.payload(), event.checksum())
        );
    }

    #[test]
    fn test_empty_name_rejected() {
        let ctx = fixed_context();
        assert!(matches!(
            EventRecord::create("", Params::new(), None, &ctx),
            Err(Error::InvalidEvent(_))
        ));
    }

    #[test]
    fn test_blank_name_accepted() {
        let ctx = fixed_context();
        let record = EventRecord::create_at(" ", Params::new(), None, 1000, &ctx).unwrap();
        assert_eq!(record.name(), " ");
        assert!(record.payload().starts_with("en= &lt=1000"));
    }

    #[test]
    fn test_restore_reproduces_checksum() {
        let ctx = fixed_context();
        let original =
            EventRecord::create_at("E", params(&[("k", "v")]), Some("body".into()), 42, &ctx)
                .unwrap();
        let restored = EventRecord::restore(
            7,
            "E".to_string(),
            params(&[("k", "v")]),
            Some("body".into()),
            42,
            "com.example".to_string(),
            "1.0".to_string(),
            "2.6".to_string(),
            &ctx,
        )
        .unwrap();

        assert_eq!(restored.id(), Some(7));
        assert_eq!(restored.checksum(), original.checksum());
    }

    #[test]
    fn test_assign_id_only_once() {
        let ctx = fixed_context();
        let mut event = EventRecord::create_at("E", Params::new(), None, 1, &ctx).unwrap();
        assert_eq!(event.id(), None);
        event.assign_id(3);
        event.assign_id(4);
        assert_eq!(event.id(), Some(3));
    }
}
