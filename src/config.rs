//! Injection configuration and well-known paths
//!
//! The engine is a pure function of (Pod, [`InjectorConfig`]). Nothing in the
//! engine reads the environment; callers build the config once at startup.

/// Name of the injected proxy init container
pub const SIDECAR_NAME: &str = "mca-proxy";

/// Name of the ephemeral volume delivering substitute credentials
pub const REDIRECT_VOLUME: &str = "kube-api-access-mca-sa";

/// Canonical service-account mount path seen by application containers
pub const SERVICE_ACCOUNT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Mount path of the redirect volume inside the sidecar itself. The sidecar
/// keeps its real credentials at the canonical path and populates this one.
pub const SIDECAR_CREDENTIAL_PATH: &str = "/var/run/secrets/kubernetes.io/mca-serviceaccount";

/// Loopback address the proxy listens on
pub const PROXY_HOST: &str = "127.0.0.1";

/// Port the proxy listens on, mirroring the API server's conventional port
pub const PROXY_PORT: u16 = 6443;

/// Environment variable carrying the sidecar image reference
pub const PROXY_IMAGE_ENV: &str = "MCA_PROXY_IMAGE";

/// Configuration consumed by the mutation engine at call time
#[derive(Debug, Clone)]
pub struct InjectorConfig {
    /// Container image for the default sidecar
    pub proxy_image: String,
    /// Name identifying the sidecar init container
    pub sidecar_name: String,
    /// Service-account mount path to redirect (matched by mountPath)
    pub service_account_path: String,
    /// Where the sidecar mounts the redirect volume
    pub sidecar_credential_path: String,
    /// Name of the redirect volume and of rewritten mounts
    pub redirect_volume: String,
    /// Value injected as `KUBERNETES_SERVICE_HOST`
    pub proxy_host: String,
    /// Value injected as `KUBERNETES_SERVICE_PORT`
    pub proxy_port: u16,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self {
            proxy_image: String::new(),
            sidecar_name: SIDECAR_NAME.to_string(),
            service_account_path: SERVICE_ACCOUNT_PATH.to_string(),
            sidecar_credential_path: SIDECAR_CREDENTIAL_PATH.to_string(),
            redirect_volume: REDIRECT_VOLUME.to_string(),
            proxy_host: PROXY_HOST.to_string(),
            proxy_port: PROXY_PORT,
        }
    }
}

impl InjectorConfig {
    /// Build a config with an explicit sidecar image
    ///
    /// An empty image is accepted here; the engine rejects it with a
    /// missing-configuration error only when it actually needs to construct
    /// the default sidecar.
    pub fn with_image(image: impl Into<String>) -> Self {
        Self {
            proxy_image: image.into(),
            ..Default::default()
        }
    }
}
