//! Pod mutation engine for MCA proxy sidecar injection
//!
//! The engine is the one piece of real business logic in this repository: a
//! pure transformation over a Pod spec that installs the proxy sidecar and
//! redirects every application container's Kubernetes API access through it.
//!
//! Invariants established on every successful call, regardless of input:
//!
//! 1. exactly one init container with the sidecar name, at index 0
//! 2. a pre-existing sidecar is adopted verbatim, only its position changes
//! 3. every non-sidecar container mounts the redirect volume at the canonical
//!    service-account path and carries the two redirect env vars
//! 4. the redirect volume exists in `spec.volumes` exactly once
//! 5. the whole transformation is a fixed point on its own output

mod sidecar;

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, Pod, PodSpec, Volume, VolumeMount,
};

use crate::config::InjectorConfig;
use crate::error::Error;
use crate::Result;

/// Env var redirected to the in-pod proxy's loopback address
const SERVICE_HOST_ENV: &str = "KUBERNETES_SERVICE_HOST";

/// Env var redirected to the in-pod proxy's port
const SERVICE_PORT_ENV: &str = "KUBERNETES_SERVICE_PORT";

/// The pod mutation engine
///
/// Stateless and synchronous; safe to share behind an `Arc` and invoke from
/// any number of request handlers concurrently.
pub struct Injector {
    config: InjectorConfig,
}

impl Injector {
    /// Create an engine with the given configuration
    pub fn new(config: InjectorConfig) -> Self {
        Self { config }
    }

    /// The configuration this engine was built with
    pub fn config(&self) -> &InjectorConfig {
        &self.config
    }

    /// Inject the proxy sidecar and redirect all containers
    ///
    /// Either every step completes and the fully mutated pod is returned, or
    /// the pod is rejected and nothing is returned. The only failure modes
    /// are a pod that cannot be expressed (no spec, ambiguous container
    /// names) and a missing sidecar image when the default sidecar is needed.
    pub fn mutate(&self, mut pod: Pod) -> Result<Pod> {
        let spec = pod
            .spec
            .as_mut()
            .ok_or_else(|| Error::malformed_pod("pod has no spec"))?;

        ensure_unique_names(spec)?;

        self.normalize_sidecar(spec)?;

        // The default projected token must never reach application
        // containers; credential exposure is managed through the redirect
        // volume instead. The sidecar receives its own token via the
        // service-account admission path.
        spec.automount_service_account_token = Some(false);

        for container in spec.containers.iter_mut() {
            self.redirect(container);
        }

        self.ensure_redirect_volume(spec);

        Ok(pod)
    }

    /// Place the sidecar at index 0 of `initContainers`
    ///
    /// An existing sidecar is removed from wherever it sits and re-prepended
    /// with all user-supplied fields intact. Removal-then-prepend (rather
    /// than insertion) is what keeps repeated injection from accumulating
    /// duplicates. Remaining init containers keep their relative order and
    /// are redirected like application containers.
    fn normalize_sidecar(&self, spec: &mut PodSpec) -> Result<()> {
        let mut rest = spec.init_containers.take().unwrap_or_default();

        let sidecar = match rest.iter().position(|c| c.name == self.config.sidecar_name) {
            Some(idx) => rest.remove(idx),
            None => {
                if self.config.proxy_image.is_empty() {
                    return Err(Error::missing_config(format!(
                        "proxy image is not set ({})",
                        crate::config::PROXY_IMAGE_ENV
                    )));
                }
                sidecar::default_sidecar(&self.config)
            }
        };

        for container in rest.iter_mut() {
            self.redirect(container);
        }

        let mut init_containers = Vec::with_capacity(rest.len() + 1);
        init_containers.push(sidecar);
        init_containers.append(&mut rest);
        spec.init_containers = Some(init_containers);

        Ok(())
    }

    /// Point one container's API access at the in-pod proxy
    fn redirect(&self, container: &mut Container) {
        self.upsert_service_account_mount(container);
        self.upsert_env(container);
    }

    /// Rewrite or insert the service-account mount
    ///
    /// Matching is keyed on `mountPath`, not `name`: the input pod may call
    /// its credential mount anything. A matched mount only has its name
    /// rewritten; mountPath and readOnly are left alone.
    fn upsert_service_account_mount(&self, container: &mut Container) {
        let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
        match mounts
            .iter_mut()
            .find(|m| m.mount_path == self.config.service_account_path)
        {
            Some(mount) => mount.name = self.config.redirect_volume.clone(),
            None => mounts.push(VolumeMount {
                name: self.config.redirect_volume.clone(),
                mount_path: self.config.service_account_path.clone(),
                read_only: Some(true),
                ..Default::default()
            }),
        }
    }

    /// Upsert the two redirect env vars with name-keyed update-or-append
    ///
    /// Updated entries keep their original position; a conflicting
    /// `valueFrom` is cleared so the literal value wins. Untouched entries
    /// are never reordered.
    fn upsert_env(&self, container: &mut Container) {
        let upserts = [
            (SERVICE_HOST_ENV, self.config.proxy_host.clone()),
            (SERVICE_PORT_ENV, self.config.proxy_port.to_string()),
        ];

        let env = container.env.get_or_insert_with(Vec::new);
        for (name, value) in upserts {
            match env.iter_mut().find(|e| e.name == name) {
                Some(var) => {
                    var.value = Some(value);
                    var.value_from = None;
                }
                None => env.push(EnvVar {
                    name: name.to_string(),
                    value: Some(value),
                    ..Default::default()
                }),
            }
        }
    }

    /// Append the redirect volume if absent; never duplicate or replace
    ///
    /// An existing volume's source is left untouched so re-injection of an
    /// already-mutated pod is a no-op here.
    fn ensure_redirect_volume(&self, spec: &mut PodSpec) {
        let volumes = spec.volumes.get_or_insert_with(Vec::new);
        if volumes.iter().any(|v| v.name == self.config.redirect_volume) {
            return;
        }
        volumes.push(Volume {
            name: self.config.redirect_volume.clone(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
    }
}

/// Reject pods whose container names are ambiguous
///
/// Kubernetes requires names to be unique across init and application
/// containers; a duplicate would make "the sidecar" unidentifiable.
fn ensure_unique_names(spec: &PodSpec) -> Result<()> {
    let mut seen = BTreeSet::new();
    for container in spec
        .init_containers
        .iter()
        .flatten()
        .chain(spec.containers.iter())
    {
        if !seen.insert(container.name.as_str()) {
            return Err(Error::malformed_pod(format!(
                "duplicate container name '{}'",
                container.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{REDIRECT_VOLUME, SERVICE_ACCOUNT_PATH};

    fn injector() -> Injector {
        Injector::new(InjectorConfig::with_image("ghcr.io/example/mca:v1"))
    }

    fn container(name: &str, image: &str) -> Container {
        Container {
            name: name.to_string(),
            image: Some(image.to_string()),
            ..Default::default()
        }
    }

    fn pod_with_containers(containers: Vec<Container>) -> Pod {
        Pod {
            spec: Some(PodSpec {
                containers,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn sa_mount(name: &str) -> VolumeMount {
        VolumeMount {
            name: name.to_string(),
            mount_path: SERVICE_ACCOUNT_PATH.to_string(),
            ..Default::default()
        }
    }

    // =========================================================================
    // Unit Tests
    // =========================================================================

    #[test]
    fn adds_proxy_init_container_first() {
        let pod = pod_with_containers(vec![container("app", "nginx")]);

        let result = injector().mutate(pod).unwrap();
        let init = result.spec.as_ref().unwrap().init_containers.as_ref().unwrap();

        assert_eq!(init.len(), 1);
        assert_eq!(init[0].name, "mca-proxy");
        assert_eq!(init[0].image.as_deref(), Some("ghcr.io/example/mca:v1"));
        assert_eq!(init[0].args, Some(vec!["proxy".to_string()]));

        let security = init[0].security_context.as_ref().unwrap();
        assert_eq!(security.run_as_non_root, Some(true));
        assert_eq!(security.run_as_user, Some(999));
    }

    #[test]
    fn preserves_existing_sidecar_fields() {
        let custom = Container {
            name: "mca-proxy".to_string(),
            image: Some("custom-proxy:v2".to_string()),
            args: Some(vec!["--custom-arg".to_string()]),
            ..Default::default()
        };
        let mut pod = pod_with_containers(vec![container("app", "nginx")]);
        pod.spec.as_mut().unwrap().init_containers = Some(vec![custom]);

        let result = injector().mutate(pod).unwrap();
        let init = result.spec.as_ref().unwrap().init_containers.as_ref().unwrap();

        assert_eq!(init.len(), 1);
        assert_eq!(init[0].image.as_deref(), Some("custom-proxy:v2"));
        assert_eq!(init[0].args, Some(vec!["--custom-arg".to_string()]));
    }

    #[test]
    fn other_init_containers_keep_relative_order() {
        let mut pod = pod_with_containers(vec![container("app", "nginx")]);
        pod.spec.as_mut().unwrap().init_containers = Some(vec![
            container("init-db", "postgres:init"),
            container("init-cache", "redis:init"),
        ]);

        let result = injector().mutate(pod).unwrap();
        let init = result.spec.as_ref().unwrap().init_containers.as_ref().unwrap();

        assert_eq!(init.len(), 3);
        assert_eq!(init[0].name, "mca-proxy");
        assert_eq!(init[1].name, "init-db");
        assert_eq!(init[2].name, "init-cache");
    }

    #[test]
    fn sidecar_in_middle_is_moved_to_front() {
        let mut pod = pod_with_containers(vec![container("app", "nginx")]);
        pod.spec.as_mut().unwrap().init_containers = Some(vec![
            container("init-db", "postgres:init"),
            container("mca-proxy", "custom-proxy:v3"),
            container("init-cache", "redis:init"),
        ]);

        let result = injector().mutate(pod).unwrap();
        let init = result.spec.as_ref().unwrap().init_containers.as_ref().unwrap();

        assert_eq!(init.len(), 3);
        assert_eq!(init[0].name, "mca-proxy");
        assert_eq!(init[0].image.as_deref(), Some("custom-proxy:v3"));
        assert_eq!(init[1].name, "init-db");
        assert_eq!(init[2].name, "init-cache");
    }

    #[test]
    fn rewrites_matching_mount_by_path() {
        let mut app = container("app", "nginx");
        app.volume_mounts = Some(vec![sa_mount("kube-api-access")]);
        let pod = pod_with_containers(vec![app]);

        let result = injector().mutate(pod).unwrap();
        let mounts = result.spec.as_ref().unwrap().containers[0]
            .volume_mounts
            .as_ref()
            .unwrap();

        // name rewritten, mountPath and readOnly untouched
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].name, REDIRECT_VOLUME);
        assert_eq!(mounts[0].mount_path, SERVICE_ACCOUNT_PATH);
        assert_eq!(mounts[0].read_only, None);
    }

    #[test]
    fn inserts_mount_when_no_path_matches() {
        let mut app = container("app", "nginx");
        app.volume_mounts = Some(vec![VolumeMount {
            name: "data".to_string(),
            mount_path: "/data".to_string(),
            ..Default::default()
        }]);
        let pod = pod_with_containers(vec![app]);

        let result = injector().mutate(pod).unwrap();
        let mounts = result.spec.as_ref().unwrap().containers[0]
            .volume_mounts
            .as_ref()
            .unwrap();

        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].name, "data");
        assert_eq!(mounts[1].name, REDIRECT_VOLUME);
        assert_eq!(mounts[1].mount_path, SERVICE_ACCOUNT_PATH);
        assert_eq!(mounts[1].read_only, Some(true));
    }

    #[test]
    fn injects_both_env_vars() {
        let pod = pod_with_containers(vec![container("app", "nginx")]);

        let result = injector().mutate(pod).unwrap();
        let env = result.spec.as_ref().unwrap().containers[0].env.as_ref().unwrap();

        assert_eq!(env.len(), 2);
        assert_eq!(env[0].name, "KUBERNETES_SERVICE_HOST");
        assert_eq!(env[0].value.as_deref(), Some("127.0.0.1"));
        assert_eq!(env[1].name, "KUBERNETES_SERVICE_PORT");
        assert_eq!(env[1].value.as_deref(), Some("6443"));
    }

    #[test]
    fn env_upsert_preserves_unrelated_vars_and_positions() {
        let mut app = container("app", "nginx");
        app.env = Some(vec![
            EnvVar {
                name: "APP_ENV".to_string(),
                value: Some("production".to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "KUBERNETES_SERVICE_HOST".to_string(),
                value: Some("10.96.0.1".to_string()),
                ..Default::default()
            },
        ]);
        let pod = pod_with_containers(vec![app]);

        let result = injector().mutate(pod).unwrap();
        let env = result.spec.as_ref().unwrap().containers[0].env.as_ref().unwrap();

        assert_eq!(env.len(), 3);
        // untouched entry keeps its slot; updated entry keeps its slot
        assert_eq!(env[0].name, "APP_ENV");
        assert_eq!(env[0].value.as_deref(), Some("production"));
        assert_eq!(env[1].name, "KUBERNETES_SERVICE_HOST");
        assert_eq!(env[1].value.as_deref(), Some("127.0.0.1"));
        assert_eq!(env[2].name, "KUBERNETES_SERVICE_PORT");
    }

    #[test]
    fn env_upsert_clears_conflicting_value_from() {
        use k8s_openapi::api::core::v1::{EnvVarSource, ObjectFieldSelector};

        let mut app = container("app", "nginx");
        app.env = Some(vec![EnvVar {
            name: "KUBERNETES_SERVICE_HOST".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "status.hostIP".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        let pod = pod_with_containers(vec![app]);

        let result = injector().mutate(pod).unwrap();
        let env = result.spec.as_ref().unwrap().containers[0].env.as_ref().unwrap();

        assert_eq!(env[0].value.as_deref(), Some("127.0.0.1"));
        assert!(env[0].value_from.is_none());
    }

    #[test]
    fn init_containers_are_redirected_too() {
        let mut pod = pod_with_containers(vec![container("app", "nginx")]);
        pod.spec.as_mut().unwrap().init_containers =
            Some(vec![container("init-db", "postgres:init")]);

        let result = injector().mutate(pod).unwrap();
        let init = result.spec.as_ref().unwrap().init_containers.as_ref().unwrap();

        let redirected = &init[1];
        assert_eq!(redirected.name, "init-db");
        let mounts = redirected.volume_mounts.as_ref().unwrap();
        assert!(mounts.iter().any(|m| m.name == REDIRECT_VOLUME));
        assert_eq!(redirected.env.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn sidecar_itself_is_not_redirected() {
        let pod = pod_with_containers(vec![container("app", "nginx")]);

        let result = injector().mutate(pod).unwrap();
        let sidecar = &result.spec.as_ref().unwrap().init_containers.as_ref().unwrap()[0];

        // the sidecar keeps its template mounts and env untouched
        let mounts = sidecar.volume_mounts.as_ref().unwrap();
        assert_eq!(mounts.len(), 1);
        assert_ne!(mounts[0].mount_path, SERVICE_ACCOUNT_PATH);
        let env = sidecar.env.as_ref().unwrap();
        assert!(env.iter().all(|e| e.name != "KUBERNETES_SERVICE_HOST"));
    }

    #[test]
    fn adds_redirect_volume_once() {
        let pod = pod_with_containers(vec![container("app", "nginx")]);

        let result = injector().mutate(pod).unwrap();
        let volumes = result.spec.as_ref().unwrap().volumes.as_ref().unwrap();

        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, REDIRECT_VOLUME);
        assert!(volumes[0].empty_dir.is_some());
    }

    #[test]
    fn does_not_duplicate_or_replace_existing_volume() {
        use k8s_openapi::api::core::v1::ProjectedVolumeSource;

        let mut pod = pod_with_containers(vec![container("app", "nginx")]);
        pod.spec.as_mut().unwrap().volumes = Some(vec![Volume {
            name: REDIRECT_VOLUME.to_string(),
            projected: Some(ProjectedVolumeSource::default()),
            ..Default::default()
        }]);

        let result = injector().mutate(pod).unwrap();
        let volumes = result.spec.as_ref().unwrap().volumes.as_ref().unwrap();

        assert_eq!(volumes.len(), 1);
        // source untouched: still projected, no emptyDir forced in
        assert!(volumes[0].projected.is_some());
        assert!(volumes[0].empty_dir.is_none());
    }

    #[test]
    fn preserves_existing_volumes() {
        let mut pod = pod_with_containers(vec![container("app", "nginx")]);
        pod.spec.as_mut().unwrap().volumes = Some(vec![
            Volume {
                name: "data".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
            Volume {
                name: "config".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
        ]);

        let result = injector().mutate(pod).unwrap();
        let volumes = result.spec.as_ref().unwrap().volumes.as_ref().unwrap();

        let names: Vec<_> = volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["data", "config", REDIRECT_VOLUME]);
    }

    #[test]
    fn disables_service_account_automount() {
        let pod = pod_with_containers(vec![container("app", "nginx")]);

        let result = injector().mutate(pod).unwrap();

        assert_eq!(
            result.spec.as_ref().unwrap().automount_service_account_token,
            Some(false)
        );
    }

    #[test]
    fn multiple_containers_with_mixed_mounts() {
        let mut app = container("app", "nginx");
        app.volume_mounts = Some(vec![sa_mount("kube-api-access")]);
        let mut side = container("logger", "fluentbit");
        side.volume_mounts = Some(vec![VolumeMount {
            name: "data".to_string(),
            mount_path: "/data".to_string(),
            ..Default::default()
        }]);
        let mut other = container("another-app", "another");
        other.volume_mounts = Some(vec![sa_mount("kube-api-access-2")]);

        let pod = pod_with_containers(vec![app, side, other]);
        let result = injector().mutate(pod).unwrap();
        let containers = &result.spec.as_ref().unwrap().containers;

        // first: existing mount renamed in place
        assert_eq!(containers[0].volume_mounts.as_ref().unwrap()[0].name, REDIRECT_VOLUME);
        // second: mount appended after the unrelated one
        let mounts = containers[1].volume_mounts.as_ref().unwrap();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].name, "data");
        assert_eq!(mounts[1].name, REDIRECT_VOLUME);
        // third: arbitrarily named mount matched by path and renamed
        assert_eq!(containers[2].volume_mounts.as_ref().unwrap()[0].name, REDIRECT_VOLUME);

        for c in containers {
            assert_eq!(c.env.as_ref().unwrap().len(), 2);
        }
    }

    #[test]
    fn pod_without_spec_is_rejected() {
        let pod = Pod::default();
        let err = injector().mutate(pod).unwrap_err();
        assert!(matches!(err, Error::MalformedPod(_)));
    }

    #[test]
    fn duplicate_container_names_are_rejected() {
        let pod = pod_with_containers(vec![container("app", "nginx"), container("app", "redis")]);
        let err = injector().mutate(pod).unwrap_err();
        assert!(matches!(err, Error::MalformedPod(_)));
        assert!(err.to_string().contains("app"));
    }

    #[test]
    fn missing_image_is_rejected_when_default_sidecar_needed() {
        let engine = Injector::new(InjectorConfig::default());
        let pod = pod_with_containers(vec![container("app", "nginx")]);

        let err = engine.mutate(pod).unwrap_err();
        assert!(matches!(err, Error::MissingConfig(_)));
    }

    #[test]
    fn missing_image_is_fine_when_sidecar_already_present() {
        let engine = Injector::new(InjectorConfig::default());
        let mut pod = pod_with_containers(vec![container("app", "nginx")]);
        pod.spec.as_mut().unwrap().init_containers =
            Some(vec![container("mca-proxy", "custom:v1")]);

        let result = engine.mutate(pod).unwrap();
        let init = result.spec.as_ref().unwrap().init_containers.as_ref().unwrap();
        assert_eq!(init[0].image.as_deref(), Some("custom:v1"));
    }

    // =========================================================================
    // Story Tests
    // =========================================================================

    /// Story: the canonical injection scenario
    ///
    /// An nginx pod with the usual projected token mount goes in; a pod whose
    /// API access flows through the sidecar comes out.
    #[test]
    fn story_basic_pod_injection() {
        let mut app = container("app", "nginx");
        app.volume_mounts = Some(vec![sa_mount("kube-api-access")]);
        let pod = pod_with_containers(vec![app]);

        let result = injector().mutate(pod).unwrap();
        let spec = result.spec.as_ref().unwrap();

        assert_eq!(spec.init_containers.as_ref().unwrap()[0].name, "mca-proxy");

        let app = &spec.containers[0];
        assert_eq!(app.volume_mounts.as_ref().unwrap()[0].name, REDIRECT_VOLUME);
        assert_eq!(app.volume_mounts.as_ref().unwrap()[0].mount_path, SERVICE_ACCOUNT_PATH);

        let env = app.env.as_ref().unwrap();
        assert_eq!(env.len(), 2);

        let volumes = spec.volumes.as_ref().unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, REDIRECT_VOLUME);
    }

    /// Story: injection is idempotent
    ///
    /// With `reinvocationPolicy: IfNeeded` the webhook may run again on its
    /// own output. The second pass must be a fixed point: same container
    /// counts, same ordering, same env sets, same volumes.
    #[test]
    fn story_double_injection_is_a_fixed_point() {
        let mut app = container("app", "nginx");
        app.volume_mounts = Some(vec![sa_mount("kube-api-access")]);
        let mut pod = pod_with_containers(vec![app]);
        pod.spec.as_mut().unwrap().init_containers =
            Some(vec![container("init-db", "postgres:init")]);

        let engine = injector();
        let once = engine.mutate(pod).unwrap();
        let twice = engine.mutate(once.clone()).unwrap();

        assert_eq!(once, twice);

        let spec = twice.spec.as_ref().unwrap();
        assert_eq!(spec.init_containers.as_ref().unwrap().len(), 2);
        assert_eq!(spec.containers.len(), 1);
        assert_eq!(spec.volumes.as_ref().unwrap().len(), 1);
        assert_eq!(spec.containers[0].env.as_ref().unwrap().len(), 2);
    }

    /// Story: an operator ships their own proxy build
    ///
    /// A pod authored with a pinned `mca-proxy` init container keeps its
    /// image, args and extra config across injection; only the position is
    /// normalized.
    #[test]
    fn story_operator_pinned_sidecar_is_adopted() {
        let pinned = Container {
            name: "mca-proxy".to_string(),
            image: Some("registry.internal/mca:pinned".to_string()),
            args: Some(vec!["proxy".to_string(), "--verbose".to_string()]),
            ..Default::default()
        };
        let mut pod = pod_with_containers(vec![container("app", "nginx")]);
        pod.spec.as_mut().unwrap().init_containers = Some(vec![pinned.clone()]);

        let engine = injector();
        let result = engine.mutate(pod).unwrap();
        let adopted = &result.spec.as_ref().unwrap().init_containers.as_ref().unwrap()[0];

        assert_eq!(adopted.image, pinned.image);
        assert_eq!(adopted.args, pinned.args);

        // and it survives a second pass unchanged
        let again = engine.mutate(result).unwrap();
        let adopted = &again.spec.as_ref().unwrap().init_containers.as_ref().unwrap()[0];
        assert_eq!(adopted.image, pinned.image);
    }
}
