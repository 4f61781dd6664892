#![warn(clippy::dbg_macro, clippy::todo)]

mod ca_bundle;
mod config;
mod mutation;
mod webhook;

use config::BundleConfigMapSpec;
use kube::{client::Client, core::admission::SerializePatchError};
use log::error;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    KubeError {
        #[from]
        source: kube::Error,
    },
    #[error("ConfigMap {namespace}/{name} not found")]
    BundleNotFound { namespace: String, name: String },
    #[error("key {key} not found in ConfigMap {namespace}/{name}")]
    MissingBundleKey {
        namespace: String,
        name: String,
        key: String,
    },
    #[error("timed out fetching ConfigMap {namespace}/{name}")]
    BundleLookupTimeout { namespace: String, name: String },
    #[error("Invalid input: {0}")]
    UserInputError(String),
    #[error("Failed to generate certificate: {0}")]
    CertError(#[from] rcgen::Error),
    #[error("Failed to serialize patch: {0}")]
    PatchError(#[from] SerializePatchError),
    #[error("Failed to encode object for diff: {0}")]
    DiffError(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() -> Result<(), kube::Error> {
    env_logger::Builder::new()
        .parse_env(env_logger::Env::default().default_filter_or("info"))
        .init();
    let client = Client::try_default().await?;

    let bundle = BundleConfigMapSpec::from_env();

    let certificate = match webhook::load_cert(client.clone()).await {
        Ok(x) => x,
        Err(e) => {
            error!("failed to create/load webhook TLS cert: {e:?}");
            std::process::exit(1);
        }
    };

    if let Err(e) = webhook::prepare_webhook(client.clone(), &certificate).await {
        error!("failed to apply webhook config: {e:?}");
        std::process::exit(1);
    }

    if let Err(e) = webhook::run_webhook(&certificate, bundle).await {
        error!("webhook failed to run: {e:?}");
        std::process::exit(1);
    }

    Ok(())
}
