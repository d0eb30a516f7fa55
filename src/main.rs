//! MCA - sidecar injection and API proxying for Kubernetes Pods

use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::Client;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mca::config::{InjectorConfig, PROXY_HOST, PROXY_IMAGE_ENV, PROXY_PORT};
use mca::inject::Injector;
use mca::webhook::registration::WEBHOOK_DNS_NAMES;
use mca::webhook::{self, WebhookState};
use mca::{pki, proxy, WEBHOOK_PORT};

/// MCA - route Pod traffic to the Kubernetes API through an in-pod proxy
#[derive(Parser, Debug)]
#[command(name = "mca", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inject the sidecar into a Pod manifest
    ///
    /// Reads a YAML Pod manifest on stdin and writes the mutated manifest to
    /// stdout. Intended for offline use and GitOps pipelines; the webhook
    /// applies the same transformation in-cluster.
    Inject(InjectorArgs),

    /// Run the mutating admission webhook
    ///
    /// Generates a fresh serving certificate, registers the
    /// MutatingWebhookConfiguration with the current CA bundle, then serves
    /// admission reviews over HTTPS.
    Webhook(InjectorArgs),

    /// Run the in-pod API proxy (sidecar mode)
    ///
    /// Started by the injected init container. Writes substitute credentials
    /// into the shared volume and forwards API requests under the sidecar's
    /// own service account.
    Proxy,
}

/// Injection configuration shared by the CLI and webhook modes
#[derive(Parser, Debug)]
struct InjectorArgs {
    /// Container image for the injected proxy sidecar
    ///
    /// May be left empty when every target pod ships its own `mca-proxy`
    /// init container; the engine rejects pods that would need the default
    /// sidecar without it.
    #[arg(long, env = PROXY_IMAGE_ENV, default_value = "")]
    proxy_image: String,
}

impl InjectorArgs {
    fn injector(&self) -> Injector {
        Injector::new(InjectorConfig::with_image(self.proxy_image.clone()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - FIPS-validated aws-lc-rs
    // This MUST succeed for the application to operate securely.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install crypto provider: {:?}. \
             The application cannot operate securely without a working TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Inject(args) => run_inject(args),
        Commands::Webhook(args) => run_webhook(args).await,
        Commands::Proxy => run_proxy().await,
    }
}

/// Inject the sidecar into a manifest read from stdin
fn run_inject(args: InjectorArgs) -> anyhow::Result<()> {
    let mut manifest = Vec::new();
    std::io::stdin()
        .read_to_end(&mut manifest)
        .map_err(|e| anyhow::anyhow!("Failed to read manifest from stdin: {}", e))?;

    let output = mca::manifest::inject(&args.injector(), &manifest)?;

    print!("{output}");
    Ok(())
}

/// Run the admission webhook: mint PKI, register, serve
async fn run_webhook(args: InjectorArgs) -> anyhow::Result<()> {
    tracing::info!("MCA webhook starting...");

    let certificate = pki::generate_server_certificate("mca-webhook", &WEBHOOK_DNS_NAMES, &[])?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    // Registration carries this boot's CA bundle; server-side apply replaces
    // whatever a previous boot registered.
    webhook::registration::apply_webhook_configuration(client, &certificate.ca_cert_pem).await?;

    let state = Arc::new(WebhookState::new(args.injector()));
    let addr = SocketAddr::from(([0, 0, 0, 0], WEBHOOK_PORT));

    webhook::start_server(state, addr, &certificate).await?;
    Ok(())
}

/// Run the in-pod proxy: mint PKI, publish credentials, serve on loopback
async fn run_proxy() -> anyhow::Result<()> {
    tracing::info!("MCA proxy sidecar starting...");

    let certificate = pki::generate_server_certificate(
        "mca-proxy",
        &["localhost", "kubernetes.default.svc"],
        &[
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
        ],
    )?;

    // Must land in the shared volume before application containers start;
    // running as a native sidecar guarantees that ordering.
    proxy::write_sidecar_credentials(&certificate.ca_cert_pem)?;

    let state = Arc::new(proxy::ProxyState::from_cluster_env()?);
    let addr = SocketAddr::new(
        PROXY_HOST
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid proxy host: {}", e))?,
        PROXY_PORT,
    );

    proxy::start_server(state, addr, &certificate).await?;
    Ok(())
}
