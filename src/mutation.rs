use std::{collections::BTreeMap, time::Duration};

use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::{Api, Client, ResourceExt};
use log::{error, info};

use crate::{
    ca_bundle::InjectCa,
    config::BundleConfigMapSpec,
    Error,
};

const BUNDLE_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// One mutation strategy in the pipeline. Closed set on purpose: new
/// strategies are new variants, applied in declaration order.
pub enum PodMutation {
    InjectCaBundle(InjectCa),
}

impl PodMutation {
    pub fn name(&self) -> &'static str {
        match self {
            PodMutation::InjectCaBundle(inject) => inject.name(),
        }
    }

    pub fn apply(&self, pod: Pod) -> Result<Pod, Error> {
        match self {
            PodMutation::InjectCaBundle(inject) => inject.mutate(pod),
        }
    }
}

/// Per-request mutation engine: verifies the bundle ConfigMap exists, runs
/// the mutation pipeline over a copy of the Pod, and diffs the copy against
/// the untouched original. Holds no state across requests.
pub struct Mutator {
    bundle: BundleConfigMapSpec,
    lookup_timeout: Duration,
}

impl Mutator {
    pub fn new(bundle: BundleConfigMapSpec) -> Self {
        Mutator {
            bundle,
            lookup_timeout: BUNDLE_LOOKUP_TIMEOUT,
        }
    }

    pub async fn mutate_pod_patch(
        &self,
        client: &Client,
        pod: &Pod,
    ) -> Result<json_patch::Patch, Error> {
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
        self.check_bundle_configmap(client, &namespace).await?;

        // The original is the diff baseline and must never be touched; the
        // pipeline works on its own copy.
        let mutated = self.apply_mutations(pod)?;

        Ok(json_patch::diff(
            &serde_json::to_value(pod)?,
            &serde_json::to_value(&mutated)?,
        ))
    }

    pub fn apply_mutations(&self, pod: &Pod) -> Result<Pod, Error> {
        let mutations = [PodMutation::InjectCaBundle(InjectCa {
            bundle: self.bundle.clone(),
        })];

        let mut mutated = pod.clone();
        for mutation in &mutations {
            info!("applying mutation {} to pod {}", mutation.name(), pod.name_any());
            mutated = mutation.apply(mutated)?;
        }
        Ok(mutated)
    }

    async fn check_bundle_configmap(&self, client: &Client, namespace: &str) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
        let cm = tokio::time::timeout(self.lookup_timeout, api.get_opt(&self.bundle.name))
            .await
            .map_err(|_| Error::BundleLookupTimeout {
                namespace: namespace.to_string(),
                name: self.bundle.name.clone(),
            })??
            .ok_or_else(|| Error::BundleNotFound {
                namespace: namespace.to_string(),
                name: self.bundle.name.clone(),
            })?;
        verify_bundle_key(namespace, &self.bundle, cm.data.as_ref())
    }
}

/// Checks that the configured key is present in the ConfigMap data. Observed
/// keys are logged to help diagnose misconfigured bundles; logging has no
/// effect on the outcome.
fn verify_bundle_key(
    namespace: &str,
    bundle: &BundleConfigMapSpec,
    data: Option<&BTreeMap<String, String>>,
) -> Result<(), Error> {
    for key in data.into_iter().flat_map(|d| d.keys()) {
        info!("ConfigMap {namespace}/{} has key {key}", bundle.name);
        if *key == bundle.key {
            return Ok(());
        }
    }
    error!(
        "key {} not found in ConfigMap {namespace}/{}",
        bundle.key, bundle.name
    );
    Err(Error::MissingBundleKey {
        namespace: namespace.to_string(),
        name: bundle.name.clone(),
        key: bundle.key.clone(),
    })
}
