//! HTTP transport for the event collector
//!
//! Events without post data are delivered as `GET <endpoint>?<query>`.
//! Events with post data are delivered as `POST <endpoint>?<query>` with
//! the raw post data as a fixed-length body. Only `200 OK` counts as
//! delivered.

use reqwest::{StatusCode, Url};

use crate::config::CollectorConfig;
use crate::error::{Error, Result};
use crate::event::EventRecord;

use super::{DeliveryOutcome, SendFuture, Transport};

/// reqwest-backed [`Transport`]
pub struct HttpTransport {
    http_client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    /// Create a new transport from configuration
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: &CollectorConfig) -> Result<Self> {
        config.validate()?;

        let http_client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            endpoint: config.endpoint.trim().to_string(),
        })
    }

    /// Request target for `record` sent at `send_time_ms`
    pub fn target(&self, record: &EventRecord, send_time_ms: i64) -> Result<Url> {
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        let raw = format!(
            "{}{}{}",
            self.endpoint,
            separator,
            record.query_string(send_time_ms)
        );
        Url::parse(&raw).map_err(|e| Error::Transport(format!("malformed target {}: {}", raw, e)))
    }

    async fn try_send(&self, record: &EventRecord) -> Result<()> {
        let url = self.target(record, chrono::Utc::now().timestamp_millis())?;

        let request = match record.post_data() {
            // A sized body is sent with a fixed Content-Length
            Some(body) => self.http_client.post(url).body(body.as_bytes().to_vec()),
            None => self.http_client.get(url),
        };

        let response = request
            .send()
            .await
            .map_err(|e| Error::Transport(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::OK {
            Ok(())
        } else {
            Err(Error::Transport(format!("collector responded {}", status)))
        }
    }
}

impl Transport for HttpTransport {
    fn send<'a>(&'a self, record: &'a EventRecord) -> SendFuture<'a> {
        Box::pin(async move {
            match self.try_send(record).await {
                Ok(()) => DeliveryOutcome::Delivered,
                Err(e) => DeliveryOutcome::Failed(e.to_string()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ClientContext, SdkKey};
    use crate::event::Params;

    fn test_event() -> EventRecord {
        let key = SdkKey::parse("pubKprivK").unwrap();
        let ctx = ClientContext::new(&key, "UU1", "HU1", "com.example", "1.0");
        EventRecord::create_at("Test", Params::new(), None, 1000, &ctx).unwrap()
    }

    fn transport(endpoint: &str) -> HttpTransport {
        HttpTransport::new(&CollectorConfig {
            endpoint: endpoint.to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_transport_requires_valid_config() {
        let config = CollectorConfig {
            endpoint: String::new(),
            ..Default::default()
        };
        assert!(HttpTransport::new(&config).is_err());
        assert!(HttpTransport::new(&CollectorConfig::default()).is_ok());
    }

    #[test]
    fn test_target_appends_query() {
        let event = test_event();
        let url = transport("https://collector.example.com/e/")
            .target(&event, 55)
            .unwrap();
        assert_eq!(url.path(), "/e/");
        let query = url.query().unwrap();
        assert!(query.starts_with("en=Test&lt=1000"));
        assert!(query.ends_with(&format!("&ct=55&cs={}", event.checksum())));
    }

    #[test]
    fn test_target_with_existing_query() {
        let url = transport("https://collector.example.com/e/?v=2")
            .target(&test_event(), 1)
            .unwrap();
        assert!(url.query().unwrap().starts_with("v=2&en=Test"));
    }

    #[test]
    fn test_malformed_target_is_error() {
        let result = transport("not a url").target(&test_event(), 1);
        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn test_malformed_target_fails_attempt() {
        let outcome = transport("not a url").send(&test_event()).await;
        assert!(!outcome.is_delivered());
    }
}
