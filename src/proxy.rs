//! In-pod reverse proxy for the Kubernetes API
//!
//! Runs inside the injected sidecar. Application containers believe they are
//! talking to the API server at `127.0.0.1:6443`; this server terminates
//! their TLS, swaps whatever credentials they presented for the sidecar's own
//! service-account token, and forwards the request upstream. Watch requests
//! work because response bodies are streamed, never buffered.
//!
//! The substitute credential files the application containers read from the
//! redirect volume are written here at startup: the generated CA so clients
//! trust the loopback endpoint, the pod namespace, and a placeholder token
//! (the proxy ignores inbound credentials entirely).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Method, Response, StatusCode, Uri};
use axum::Router;
use tracing::{debug, error, info};

use crate::config::{SERVICE_ACCOUNT_PATH, SIDECAR_CREDENTIAL_PATH};
use crate::pki::ServerCertificate;
use crate::{Error, Result};

/// Placeholder written as the substitute token. Clients send it, the proxy
/// discards it.
const TOKEN_PLACEHOLDER: &str = "-";

/// Shared proxy state
pub struct ProxyState {
    /// HTTP client trusting the cluster CA
    client: reqwest::Client,
    /// Base URL of the real API server
    upstream: String,
    /// Path to the sidecar's own (rotating) service-account token
    token_path: PathBuf,
}

impl ProxyState {
    /// Build proxy state from the in-cluster environment
    ///
    /// Resolves the API server address the same way official clients do and
    /// trusts the cluster CA from the sidecar's real service-account mount.
    pub fn from_cluster_env() -> Result<Self> {
        let config = kube::Config::incluster()
            .map_err(|e| Error::proxy(format!("not running in a cluster: {}", e)))?;

        let sa_path = Path::new(SERVICE_ACCOUNT_PATH);
        let ca_pem = std::fs::read(sa_path.join("ca.crt"))
            .map_err(|e| Error::proxy(format!("failed to read cluster CA: {}", e)))?;
        let ca = reqwest::Certificate::from_pem(&ca_pem)
            .map_err(|e| Error::proxy(format!("invalid cluster CA: {}", e)))?;

        let client = reqwest::Client::builder()
            .add_root_certificate(ca)
            .build()
            .map_err(|e| Error::proxy(format!("failed to build upstream client: {}", e)))?;

        Ok(Self {
            client,
            upstream: config.cluster_url.to_string().trim_end_matches('/').to_string(),
            token_path: sa_path.join("token"),
        })
    }

    /// Build proxy state against an explicit upstream (used in tests)
    #[cfg(test)]
    fn for_upstream(upstream: &str, token_path: PathBuf) -> Self {
        Self {
            client: reqwest::Client::new(),
            upstream: upstream.trim_end_matches('/').to_string(),
            token_path,
        }
    }

    /// Read the sidecar's current token
    ///
    /// Read per request rather than cached: kubelet rotates projected tokens
    /// in place.
    async fn token(&self) -> Result<String> {
        let token = tokio::fs::read_to_string(&self.token_path)
            .await
            .map_err(|e| Error::proxy(format!("failed to read token: {}", e)))?;
        Ok(token.trim().to_string())
    }
}

/// Whether a request header may be forwarded upstream
///
/// Inbound credentials are dropped so the caller's (placeholder) identity can
/// never reach the API server. Hop-by-hop and framing headers are dropped
/// because the upstream client computes its own.
fn is_forwardable_header(name: &str) -> bool {
    !matches!(
        name.to_ascii_lowercase().as_str(),
        "authorization"
            | "host"
            | "connection"
            | "keep-alive"
            | "proxy-authorization"
            | "transfer-encoding"
            | "upgrade"
            | "content-length"
    )
}

/// Forward one request to the API server under the sidecar's identity
async fn forward(
    State(state): State<Arc<ProxyState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> std::result::Result<Response<Body>, StatusCode> {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", state.upstream, path_and_query);

    let token = state.token().await.map_err(|e| {
        error!(error = %e, "token unavailable");
        StatusCode::BAD_GATEWAY
    })?;

    let body_bytes = axum::body::to_bytes(body, 10 * 1024 * 1024)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    debug!(method = %method, path = %path_and_query, "forwarding");

    let mut request = state
        .client
        .request(method, &url)
        .bearer_auth(token)
        .body(body_bytes);

    for (name, value) in headers.iter() {
        if is_forwardable_header(name.as_str()) {
            request = request.header(name, value);
        }
    }

    let upstream_response = request.send().await.map_err(|e| {
        error!(error = %e, "upstream request failed");
        StatusCode::BAD_GATEWAY
    })?;

    let mut builder = Response::builder().status(upstream_response.status().as_u16());
    for (name, value) in upstream_response.headers() {
        let lower = name.as_str().to_ascii_lowercase();
        // the streamed body re-frames itself
        if lower == "content-length" || lower == "transfer-encoding" {
            continue;
        }
        builder = builder.header(name, value);
    }

    // stream rather than collect so API watches stay open
    builder
        .body(Body::from_stream(upstream_response.bytes_stream()))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Write the substitute credential files into the shared redirect volume
///
/// Applications resolve the canonical service-account path to these files.
/// `ca.crt` is the CA that signed the proxy's loopback certificate; the
/// namespace is copied from the sidecar's real mount.
pub fn write_sidecar_credentials(ca_cert_pem: &str) -> Result<()> {
    write_credentials_at(
        Path::new(SIDECAR_CREDENTIAL_PATH),
        Path::new(SERVICE_ACCOUNT_PATH),
        ca_cert_pem,
    )
}

fn write_credentials_at(target: &Path, sa_path: &Path, ca_cert_pem: &str) -> Result<()> {
    let io = |e: std::io::Error| Error::proxy(format!("failed to write credentials: {}", e));

    std::fs::create_dir_all(target).map_err(io)?;
    std::fs::write(target.join("ca.crt"), ca_cert_pem).map_err(io)?;
    std::fs::write(target.join("token"), TOKEN_PLACEHOLDER).map_err(io)?;

    let namespace = std::fs::read_to_string(sa_path.join("namespace"))
        .map_err(|e| Error::proxy(format!("failed to read namespace: {}", e)))?;
    std::fs::write(target.join("namespace"), namespace).map_err(io)?;

    Ok(())
}

/// Serve the proxy on loopback until the process exits
pub async fn start_server(
    state: Arc<ProxyState>,
    addr: SocketAddr,
    certificate: &ServerCertificate,
) -> Result<()> {
    let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem(
        certificate.cert_pem.as_bytes().to_vec(),
        certificate.key_pem.as_bytes().to_vec(),
    )
    .await
    .map_err(|e| Error::server(format!("TLS config failed: {}", e)))?;

    let app = Router::new().fallback(forward).with_state(state);

    info!(%addr, "API proxy (HTTPS) starting");

    axum_server::bind_rustls(addr, tls_config)
        .serve(app.into_make_service())
        .await
        .map_err(|e| Error::server(e.to_string()))
}
