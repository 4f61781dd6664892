use serde::{Deserialize, Serialize};

/// Reference to the ConfigMap distributing the trusted CA bundle. The same
/// name/key pair drives both the precondition check and the injected volume
/// source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleConfigMapSpec {
    /// Name of the ConfigMap containing the CA bundle.
    pub name: String,
    /// Key in the ConfigMap that holds the certificate data.
    pub key: String,
}

impl BundleConfigMapSpec {
    pub fn from_env() -> Self {
        let mut name = std::env::var("BUNDLE_CONFIGMAP_NAME").unwrap_or_default();
        if name.is_empty() {
            name = "omega-bundle".to_string();
        }
        let mut key = std::env::var("BUNDLE_CONFIGMAP_KEY").unwrap_or_default();
        if key.is_empty() {
            key = "root-certs.pem".to_string();
        }
        BundleConfigMapSpec { name, key }
    }
}
