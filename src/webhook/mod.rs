//! Mutating admission webhook for MCA
//!
//! Intercepts Pod CREATE operations and runs the mutation engine over the
//! incoming object. The webhook never rejects silently: a pod that cannot be
//! injected is denied with the engine's error message so the failure shows up
//! on the `kubectl` command that created it.
//!
//! Serving and registration live here; the admission protocol handling is in
//! [`handler`], the `MutatingWebhookConfiguration` in [`registration`].

pub mod handler;
pub mod registration;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tracing::info;

use crate::inject::Injector;
use crate::pki::ServerCertificate;
use crate::{Error, Result};

/// Shared state for webhook handlers
#[derive(Clone)]
pub struct WebhookState {
    /// The mutation engine applied to every admitted Pod
    pub injector: Arc<Injector>,
}

impl WebhookState {
    /// Create a new webhook state around the given engine
    pub fn new(injector: Injector) -> Self {
        Self {
            injector: Arc::new(injector),
        }
    }
}

/// Create the webhook router
///
/// - POST /mutate - admission review endpoint
/// - GET /health - liveness probe
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate", post(handler::mutate_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

/// Serve the webhook over TLS until the process exits
///
/// The API server only speaks HTTPS to webhooks, so the certificate is
/// mandatory; its CA must already be registered in the webhook configuration.
pub async fn start_server(
    state: Arc<WebhookState>,
    addr: SocketAddr,
    certificate: &ServerCertificate,
) -> Result<()> {
    let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem(
        certificate.cert_pem.as_bytes().to_vec(),
        certificate.key_pem.as_bytes().to_vec(),
    )
    .await
    .map_err(|e| Error::server(format!("TLS config failed: {}", e)))?;

    let app = webhook_router(state);

    info!(%addr, "admission webhook (HTTPS) starting");

    axum_server::bind_rustls(addr, tls_config)
        .serve(app.into_make_service())
        .await
        .map_err(|e| Error::server(e.to_string()))
}
