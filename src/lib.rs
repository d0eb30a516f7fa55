//! MCA - transparent Kubernetes API access through an in-pod proxy
//!
//! MCA injects a proxy sidecar into Pod specifications so that all Kubernetes
//! API traffic originating from application containers is redirected through a
//! local proxy running inside the same pod. The injection itself is a pure
//! transformation over the Pod spec; two front-ends drive it:
//!
//! - a CLI (`mca inject`) that mutates a YAML manifest on stdin/stdout
//! - a mutating admission webhook (`mca webhook`) that patches in-flight Pods
//!
//! The injected sidecar (`mca proxy`) terminates TLS on loopback, swaps the
//! caller's credentials for its own service-account token, and forwards
//! requests to the real API server.
//!
//! # Modules
//!
//! - [`inject`] - Pod mutation engine (sidecar, redirection, volumes)
//! - [`config`] - injection configuration and well-known paths
//! - [`manifest`] - YAML manifest front-end for the CLI
//! - [`webhook`] - admission webhook handler, server, and registration
//! - [`proxy`] - in-pod reverse proxy for the Kubernetes API
//! - [`pki`] - CA and TLS server certificate generation
//! - [`error`] - error types

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod inject;
pub mod manifest;
pub mod pki;
pub mod proxy;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Port the webhook server listens on (HTTPS)
pub const WEBHOOK_PORT: u16 = 8443;
