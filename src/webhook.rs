use std::{collections::BTreeMap, convert::Infallible, net::SocketAddr};

use base64::{prelude::BASE64_STANDARD, Engine};
use k8s_openapi::api::{
    admissionregistration::v1::MutatingWebhookConfiguration,
    core::v1::{Pod, Secret},
};
use kube::{
    api::{PatchParams, PostParams},
    core::{
        admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
        ObjectMeta,
    },
    Api, Client, ResourceExt,
};
use log::{error, info, warn};
use rcgen::{CertificateParams, KeyPair};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use warp::{
    reply::{self, Reply},
    Filter,
};

use crate::{config::BundleConfigMapSpec, mutation::Mutator, Error};

const WEBHOOK_SECRET_NAME: &str = "ca-bundle-injector-webhook-cert";
const WEBHOOK_CONFIG_NAME: &str = "z-ca-bundle-injector";

#[derive(Serialize, Deserialize)]
pub struct SecretData {
    pub key: Vec<u8>,
    pub cert: Vec<u8>,
}

impl TryFrom<Secret> for SecretData {
    type Error = Error;

    fn try_from(mut value: Secret) -> Result<Self, Self::Error> {
        Ok(SecretData {
            key: value
                .data
                .as_mut()
                .and_then(|x| x.remove("tls.key"))
                .ok_or_else(|| Error::UserInputError("missing tls.key from secret".to_string()))?
                .0,
            cert: value
                .data
                .as_mut()
                .and_then(|x| x.remove("tls.crt"))
                .ok_or_else(|| Error::UserInputError("missing tls.crt from secret".to_string()))?
                .0,
        })
    }
}

pub async fn load_cert(client: Client) -> Result<SecretData, Error> {
    let secret_api: Api<Secret> = Api::default_namespaced(client.clone());
    if let Some(secret) = secret_api.get_opt(WEBHOOK_SECRET_NAME).await? {
        return secret.try_into();
    };

    let key_pair = KeyPair::generate()?;
    let cert = CertificateParams::new(vec![format!(
        "ca-bundle-injector.{}.svc",
        client.default_namespace()
    )])?
    .self_signed(&key_pair)?;

    let mut data = BTreeMap::new();
    data.insert(
        "tls.crt".to_string(),
        k8s_openapi::ByteString(cert.pem().into_bytes()),
    );
    data.insert(
        "tls.key".to_string(),
        k8s_openapi::ByteString(key_pair.serialize_pem().into_bytes()),
    );
    let out = secret_api
        .create(
            &PostParams::default(),
            &Secret {
                data: Some(data),
                immutable: Some(true),
                metadata: ObjectMeta {
                    name: Some(WEBHOOK_SECRET_NAME.to_string()),
                    namespace: Some(client.default_namespace().to_string()),
                    ..Default::default()
                },
                type_: Some("kubernetes.io/tls".to_string()),
                ..Default::default()
            },
        )
        .await;

    match out {
        Ok(out) => out.try_into(),
        Err(e) => {
            // Another replica may have created it first.
            if let Some(secret) = secret_api.get_opt(WEBHOOK_SECRET_NAME).await? {
                return secret.try_into();
            };
            Err(e.into())
        }
    }
}

pub async fn prepare_webhook(client: Client, secret: &SecretData) -> Result<(), Error> {
    let api: Api<MutatingWebhookConfiguration> = Api::all(client.clone());
    let input = api.get_opt(WEBHOOK_CONFIG_NAME).await?;
    let target: MutatingWebhookConfiguration =
        serde_json::from_value(webhook(client.default_namespace(), secret))
            .map_err(|e| Error::UserInputError(format!("invalid webhook config: {e:?}")))?;
    if input.is_none() || input.as_ref() != Some(&target) {
        api.patch(
            WEBHOOK_CONFIG_NAME,
            &PatchParams::apply("ca-bundle-injector"),
            &kube::api::Patch::Apply(target),
        )
        .await?;
    }
    Ok(())
}

fn webhook(namespace: &str, secret: &SecretData) -> Value {
    json!({
        "apiVersion": "admissionregistration.k8s.io/v1",
        "kind": "MutatingWebhookConfiguration",
        "metadata": {
            "labels": {
                "app": "ca-bundle-injector",
            },
            "name": WEBHOOK_CONFIG_NAME,
        },
        "webhooks": [{
            "admissionReviewVersions": ["v1beta1", "v1"],
            "clientConfig": {
                "caBundle": BASE64_STANDARD.encode(&secret.cert),
                "service": {
                    "name": "ca-bundle-injector",
                    "namespace": namespace,
                    "path": "/mutate",
                    "port": 8443,
                },
            },
            "name": "z-ca-bundle-injector.injector.local",
            "failurePolicy": "Ignore",
            "matchPolicy": "Equivalent",
            "reinvocationPolicy": "IfNeeded",
            "objectSelector": {
                "matchExpressions": [{
                    "key": "ca-bundle-injection",
                    "operator": "NotIn",
                    "values": ["disabled"],
                }]
            },
            "rules": [{
                "apiGroups": [""],
                "apiVersions": ["v1"],
                "operations": ["CREATE"],
                "resources": ["pods"],
                "scope": "*",
            }],
            "sideEffects": "None",
            "timeoutSeconds": 10,
        }],
    })
}

pub async fn run_webhook(secret: &SecretData, bundle: BundleConfigMapSpec) -> Result<(), Error> {
    let routes = warp::post()
        .and(
            warp::path("mutate")
                .and(warp::body::json())
                .and(warp::any().map(move || bundle.clone()))
                .and_then(mutate_handler),
        )
        .with(warp::log::log("webhook"));

    let mut bind = std::env::var("ADMISSION_BIND").unwrap_or_default();
    if bind.is_empty() {
        bind = "0.0.0.0:8443".to_string();
    }
    let bind: SocketAddr = bind
        .parse()
        .map_err(|e| Error::UserInputError(format!("invalid ADMISSION_BIND ({bind}): {e}")))?;

    info!("webhook listening on {bind}");

    warp::serve(routes)
        .tls()
        .cert(&secret.cert)
        .key(&secret.key)
        .run(bind)
        .await;

    Ok(())
}

async fn mutate_handler(
    body: AdmissionReview<Pod>,
    bundle: BundleConfigMapSpec,
) -> Result<impl Reply, Infallible> {
    let req: AdmissionRequest<_> = match body.try_into() {
        Ok(req) => req,
        Err(err) => {
            error!("invalid request: {}", err);
            return Ok(reply::json(&AdmissionResponse::invalid(err).into_review()));
        }
    };

    let mut res = AdmissionResponse::from(&req);
    if let Some(obj) = req.object {
        let name = obj.name_any();
        res = match mutate(res.clone(), &obj, bundle).await {
            Ok(res) => {
                info!("accepted: {:?} on Pod {}", req.operation, name);
                res
            }
            Err(err) => {
                warn!("denied: {:?} on {} ({})", req.operation, name, err);
                res.deny(err.to_string())
            }
        };
    };
    // Wrap the AdmissionResponse wrapped in an AdmissionReview
    Ok(reply::json(&res.into_review()))
}

async fn mutate(
    mut res: AdmissionResponse,
    obj: &Pod,
    bundle: BundleConfigMapSpec,
) -> Result<AdmissionResponse, Error> {
    let client = Client::try_default().await?;

    let patch = Mutator::new(bundle).mutate_pod_patch(&client, obj).await?;

    if !patch.0.is_empty() {
        res = res.with_patch(patch)?;
    }

    Ok(res)
}
