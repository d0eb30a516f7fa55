//! Default proxy sidecar template
//!
//! Built once from configuration as a strongly-typed container value. Used
//! only when the input pod does not already carry a sidecar of its own.

use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, ObjectFieldSelector, SecurityContext, VolumeMount,
};

use crate::config::InjectorConfig;

/// Non-root UID the proxy runs as
const SIDECAR_UID: i64 = 999;

/// Build the default proxy sidecar container from configuration
///
/// The container runs as a native sidecar (`restartPolicy: Always` on an init
/// container), so it is up before any application container starts and stays
/// up for the pod's lifetime.
pub(crate) fn default_sidecar(config: &InjectorConfig) -> Container {
    Container {
        name: config.sidecar_name.clone(),
        image: Some(config.proxy_image.clone()),
        image_pull_policy: Some("Always".to_string()),
        restart_policy: Some("Always".to_string()),
        args: Some(vec!["proxy".to_string()]),
        security_context: Some(SecurityContext {
            run_as_non_root: Some(true),
            run_as_user: Some(SIDECAR_UID),
            ..Default::default()
        }),
        env: Some(vec![EnvVar {
            name: "NAMESPACE".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.namespace".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![VolumeMount {
            name: config.redirect_volume.clone(),
            mount_path: config.sidecar_credential_path.clone(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}
