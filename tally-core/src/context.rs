//! Client identity and key material
//!
//! A [`ClientContext`] is built once when the tracker starts and is then
//! shared read-only with every event creation and delivery attempt.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use md5::{Digest, Md5};
use uuid::Uuid;

use crate::error::{Error, Result};

/// SDK version reported as `sv` on every event
pub const SDK_VERSION: &str = "2.6";

/// Number of leading SDK key characters that form the public key
const PUBLIC_KEY_LEN: usize = 4;

/// SDK key split into its public and secret halves
#[derive(Clone, PartialEq, Eq)]
pub struct SdkKey {
    public_key: String,
    private_key: String,
}

impl SdkKey {
    /// Split an SDK key. Keys of four characters or fewer are rejected.
    pub fn parse(key: &str) -> Result<Self> {
        let split = key
            .char_indices()
            .nth(PUBLIC_KEY_LEN)
            .map(|(idx, _)| idx)
            .ok_or_else(|| {
                Error::Config("sdk key must be longer than 4 characters".to_string())
            })?;

        Ok(Self {
            public_key: key[..split].to_string(),
            private_key: key[split..].to_string(),
        })
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn private_key(&self) -> &str {
        &self.private_key
    }
}

impl std::fmt::Debug for SdkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdkKey")
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Immutable identity values that every event is signed with
#[derive(Clone, PartialEq, Eq)]
pub struct ClientContext {
    /// Public half of the SDK key (`oi`)
    pub public_key: String,
    /// Secret half of the SDK key, only ever mixed into the checksum
    pub private_key: String,
    /// Per-install user id (`uu`)
    pub unique_user_id: String,
    /// Per-device id (`hu`)
    pub unique_hardware_id: String,
    /// Producing application bundle id (`bu`)
    pub bundle_id: String,
    /// Producing application version (`av`)
    pub app_version: String,
    /// SDK version (`sv`)
    pub sdk_version: String,
}

impl ClientContext {
    /// Build a context from an SDK key and the application identity.
    pub fn new(
        key: &SdkKey,
        unique_user_id: impl Into<String>,
        unique_hardware_id: impl Into<String>,
        bundle_id: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            public_key: key.public_key().to_string(),
            private_key: key.private_key().to_string(),
            unique_user_id: unique_user_id.into(),
            unique_hardware_id: unique_hardware_id.into(),
            bundle_id: bundle_id.into(),
            app_version: app_version.into(),
            sdk_version: SDK_VERSION.to_string(),
        }
    }

    /// Override the reported SDK version.
    pub fn with_sdk_version(mut self, sdk_version: impl Into<String>) -> Self {
        self.sdk_version = sdk_version.into();
        self
    }
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext")
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .field("unique_user_id", &self.unique_user_id)
            .field("unique_hardware_id", &self.unique_hardware_id)
            .field("bundle_id", &self.bundle_id)
            .field("app_version", &self.app_version)
            .field("sdk_version", &self.sdk_version)
            .finish()
    }
}

/// Generate a fresh random user id.
pub fn generate_user_id() -> String {
    encode_id(Uuid::new_v4())
}

/// Derive a stable hardware id from a device identifier.
///
/// Uses a name-based (MD5, version 3) UUID over the raw seed bytes.
pub fn hardware_id_from_seed(seed: &str) -> String {
    let mut digest = [0u8; 16];
    digest.copy_from_slice(&Md5::digest(seed.as_bytes()));
    encode_id(uuid::Builder::from_md5_bytes(digest).into_uuid())
}

/// Generate a random hardware id for devices without a usable identifier.
pub fn random_hardware_id() -> String {
    encode_id(Uuid::new_v4())
}

fn encode_id(id: Uuid) -> String {
    URL_SAFE_NO_PAD.encode(id.as_bytes())
}
