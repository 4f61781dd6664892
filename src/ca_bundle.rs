use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EnvVar, KeyToPath, Pod, PodSpec, Volume, VolumeMount,
};
use kube::ResourceExt;
use log::info;

use crate::{config::BundleConfigMapSpec, Error};

pub const CA_BUNDLE_VOLUME: &str = "ca-bundle-volume";
pub const CA_MOUNT_PATH: &str = "/etc/ssl/certs/ca-certificates.crt";
pub const CA_SUB_PATH: &str = "ca-certificates.crt";
pub const SSL_CERT_ENV_VAR: &str = "SSL_CERT_FILE";

/// Converges a Pod towards the canonical CA-bundle shape: one ConfigMap
/// volume, one read-only mount per container, and `SSL_CERT_FILE` pointing at
/// the mounted file. Idempotent; never removes unrelated volumes, mounts, or
/// env vars.
#[derive(Clone, Debug)]
pub struct InjectCa {
    pub bundle: BundleConfigMapSpec,
}

impl InjectCa {
    pub fn name(&self) -> &'static str {
        "inject-ca-bundle"
    }

    pub fn mutate(&self, mut pod: Pod) -> Result<Pod, Error> {
        let name = pod.name_any();
        let Some(spec) = pod.spec.as_mut() else {
            return Err(Error::UserInputError(format!("pod {name} has no spec")));
        };

        // Fixed order keeps the emitted patch deterministic.
        self.reconcile_volume(&name, spec);
        self.reconcile_mounts(&name, spec);
        self.reconcile_env(spec);

        Ok(pod)
    }

    fn canonical_volume(&self) -> Volume {
        Volume {
            name: CA_BUNDLE_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(self.bundle.name.clone()),
                items: Some(vec![KeyToPath {
                    key: self.bundle.key.clone(),
                    path: CA_SUB_PATH.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Ensures exactly one volume named `ca-bundle-volume` sourced from the
    /// configured ConfigMap. A same-named volume pointing elsewhere is stale
    /// (the admin renamed the backing ConfigMap) and gets replaced.
    fn reconcile_volume(&self, pod_name: &str, spec: &mut PodSpec) {
        let volumes = spec.volumes.get_or_insert_with(Vec::new);
        let canonical = volumes.iter().any(|v| {
            v.name == CA_BUNDLE_VOLUME
                && v.config_map.as_ref().and_then(|cm| cm.name.as_deref())
                    == Some(&*self.bundle.name)
        });
        if canonical {
            return;
        }
        if volumes.iter().any(|v| v.name == CA_BUNDLE_VOLUME) {
            info!(
                "replacing stale {CA_BUNDLE_VOLUME} volume in pod {pod_name} with ConfigMap {}",
                self.bundle.name
            );
            volumes.retain(|v| v.name != CA_BUNDLE_VOLUME);
        } else {
            info!(
                "injecting {CA_BUNDLE_VOLUME} volume into pod {pod_name} from ConfigMap {}",
                self.bundle.name
            );
        }
        volumes.push(self.canonical_volume());
    }

    fn reconcile_mounts(&self, pod_name: &str, spec: &mut PodSpec) {
        let mount = VolumeMount {
            name: CA_BUNDLE_VOLUME.to_string(),
            mount_path: CA_MOUNT_PATH.to_string(),
            sub_path: Some(CA_SUB_PATH.to_string()),
            read_only: Some(true),
            ..Default::default()
        };
        let init = spec.init_containers.iter_mut().flatten();
        for container in init.chain(spec.containers.iter_mut()) {
            if !has_canonical_mount(container) {
                info!(
                    "mounting {CA_BUNDLE_VOLUME} into container {} of pod {pod_name}",
                    container.name
                );
                container
                    .volume_mounts
                    .get_or_insert_with(Vec::new)
                    .push(mount.clone());
            }
        }
    }

    fn reconcile_env(&self, spec: &mut PodSpec) {
        let init = spec.init_containers.iter_mut().flatten();
        for container in init.chain(spec.containers.iter_mut()) {
            let env = container.env.get_or_insert_with(Vec::new);
            match env.iter_mut().find(|e| e.name == SSL_CERT_ENV_VAR) {
                Some(var) => {
                    if var.value.as_deref() != Some(CA_MOUNT_PATH) {
                        var.value = Some(CA_MOUNT_PATH.to_string());
                        var.value_from = None;
                    }
                }
                None => env.push(EnvVar {
                    name: SSL_CERT_ENV_VAR.to_string(),
                    value: Some(CA_MOUNT_PATH.to_string()),
                    ..Default::default()
                }),
            }
        }
    }
}

fn has_canonical_mount(container: &Container) -> bool {
    container
        .volume_mounts
        .iter()
        .flatten()
        .any(|m| {
            m.name == CA_BUNDLE_VOLUME
                && m.mount_path == CA_MOUNT_PATH
                && m.sub_path.as_deref() == Some(CA_SUB_PATH)
        })
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{EnvVarSource, ObjectFieldSelector};
    use kube::core::ObjectMeta;

    use super::*;

    fn bundle() -> BundleConfigMapSpec {
        BundleConfigMapSpec {
            name: "omega-bundle".to_string(),
            key: "root-certs.pem".to_string(),
        }
    }

    fn container(name: &str) -> Container {
        Container {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn pod(spec: PodSpec) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("test-pod".to_string()),
                ..Default::default()
            },
            spec: Some(spec),
            ..Default::default()
        }
    }

    fn mutate(pod_in: Pod) -> Pod {
        InjectCa { bundle: bundle() }.mutate(pod_in).unwrap()
    }

    #[test]
    fn injects_into_bare_pod() {
        let out = mutate(pod(PodSpec {
            containers: vec![container("app")],
            ..Default::default()
        }));
        let spec = out.spec.unwrap();

        let volumes = spec.volumes.unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, CA_BUNDLE_VOLUME);
        let cm = volumes[0].config_map.as_ref().unwrap();
        assert_eq!(cm.name.as_deref(), Some("omega-bundle"));
        let items = cm.items.as_ref().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].key, "root-certs.pem");
        assert_eq!(items[0].path, CA_SUB_PATH);

        let mounts = spec.containers[0].volume_mounts.as_ref().unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].name, CA_BUNDLE_VOLUME);
        assert_eq!(mounts[0].mount_path, CA_MOUNT_PATH);
        assert_eq!(mounts[0].sub_path.as_deref(), Some(CA_SUB_PATH));
        assert_eq!(mounts[0].read_only, Some(true));

        let env = spec.containers[0].env.as_ref().unwrap();
        assert_eq!(env.len(), 1);
        assert_eq!(env[0].name, SSL_CERT_ENV_VAR);
        assert_eq!(env[0].value.as_deref(), Some(CA_MOUNT_PATH));
    }

    #[test]
    fn covers_init_containers() {
        let out = mutate(pod(PodSpec {
            containers: vec![container("app"), container("sidecar")],
            init_containers: Some(vec![container("init")]),
            ..Default::default()
        }));
        let spec = out.spec.unwrap();

        for c in spec
            .init_containers
            .iter()
            .flatten()
            .chain(spec.containers.iter())
        {
            let mounts = c.volume_mounts.as_ref().unwrap();
            assert_eq!(
                mounts
                    .iter()
                    .filter(|m| m.name == CA_BUNDLE_VOLUME)
                    .count(),
                1,
                "container {} missing canonical mount",
                c.name
            );
            let env = c.env.as_ref().unwrap();
            assert_eq!(
                env.iter().filter(|e| e.name == SSL_CERT_ENV_VAR).count(),
                1,
                "container {} missing canonical env var",
                c.name
            );
        }
    }

    #[test]
    fn idempotent() {
        let once = mutate(pod(PodSpec {
            containers: vec![container("app")],
            init_containers: Some(vec![container("init")]),
            ..Default::default()
        }));
        let twice = mutate(once.clone());
        assert_eq!(
            serde_json::to_value(&once).unwrap(),
            serde_json::to_value(&twice).unwrap()
        );
    }

    #[test]
    fn replaces_stale_volume() {
        let stale = Volume {
            name: CA_BUNDLE_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some("renamed-bundle".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let out = mutate(pod(PodSpec {
            containers: vec![container("app")],
            volumes: Some(vec![stale]),
            ..Default::default()
        }));
        let volumes = out.spec.unwrap().volumes.unwrap();
        let matching: Vec<_> = volumes
            .iter()
            .filter(|v| v.name == CA_BUNDLE_VOLUME)
            .collect();
        assert_eq!(matching.len(), 1);
        assert_eq!(
            matching[0]
                .config_map
                .as_ref()
                .and_then(|cm| cm.name.as_deref()),
            Some("omega-bundle")
        );
    }

    #[test]
    fn preserves_unrelated_entries() {
        let out = mutate(pod(PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                env: Some(vec![EnvVar {
                    name: "OTHER".to_string(),
                    value: Some("value".to_string()),
                    ..Default::default()
                }]),
                volume_mounts: Some(vec![VolumeMount {
                    name: "data".to_string(),
                    mount_path: "/data".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: "data".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }));
        let spec = out.spec.unwrap();

        let volumes = spec.volumes.unwrap();
        assert_eq!(volumes.len(), 2);
        assert!(volumes.iter().any(|v| v.name == "data"));

        let mounts = spec.containers[0].volume_mounts.as_ref().unwrap();
        assert_eq!(mounts.len(), 2);
        assert!(mounts.iter().any(|m| m.name == "data"));

        let env = spec.containers[0].env.as_ref().unwrap();
        assert_eq!(env.len(), 2);
        assert_eq!(env[0].name, "OTHER");
        assert_eq!(env[0].value.as_deref(), Some("value"));
    }

    #[test]
    fn updates_env_in_place_without_duplicating() {
        let out = mutate(pod(PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                env: Some(vec![EnvVar {
                    name: SSL_CERT_ENV_VAR.to_string(),
                    value: Some("/old/path.crt".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        }));
        let env = out.spec.unwrap().containers[0].env.clone().unwrap();
        let matching: Vec<_> = env.iter().filter(|e| e.name == SSL_CERT_ENV_VAR).collect();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].value.as_deref(), Some(CA_MOUNT_PATH));
    }

    #[test]
    fn clears_value_from_when_canonicalizing() {
        let out = mutate(pod(PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                env: Some(vec![EnvVar {
                    name: SSL_CERT_ENV_VAR.to_string(),
                    value_from: Some(EnvVarSource {
                        field_ref: Some(ObjectFieldSelector {
                            field_path: "metadata.name".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        }));
        let env = out.spec.unwrap().containers[0].env.clone().unwrap();
        assert_eq!(env.len(), 1);
        assert_eq!(env[0].value.as_deref(), Some(CA_MOUNT_PATH));
        assert!(env[0].value_from.is_none());
    }

    #[test]
    fn stale_mount_coexists_with_appended_canonical_one() {
        // A mount with the right name but wrong path is not the canonical
        // mount; the canonical one is appended alongside it.
        let out = mutate(pod(PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                volume_mounts: Some(vec![VolumeMount {
                    name: CA_BUNDLE_VOLUME.to_string(),
                    mount_path: "/wrong/path".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        }));
        let mounts = out.spec.unwrap().containers[0].volume_mounts.clone().unwrap();
        assert_eq!(mounts.len(), 2);
        assert!(mounts
            .iter()
            .any(|m| m.mount_path == CA_MOUNT_PATH && m.sub_path.as_deref() == Some(CA_SUB_PATH)));
    }

    #[test]
    fn rejects_pod_without_spec() {
        let result = InjectCa { bundle: bundle() }.mutate(Pod::default());
        assert!(matches!(result, Err(Error::UserInputError(_))));
    }
}
