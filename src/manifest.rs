//! YAML manifest front-end for the CLI
//!
//! Thin adapter between the textual world of `kubectl`-style manifests and
//! the typed mutation engine. Parse failures and serialization failures are
//! reported as distinct error kinds so the CLI can tell "your input is not a
//! Pod" apart from "the mutated Pod could not be rendered".

use k8s_openapi::api::core::v1::Pod;

use crate::inject::Injector;
use crate::Error;
use crate::Result;

/// Parse a YAML Pod manifest, inject the sidecar, render back to YAML
pub fn inject(injector: &Injector, manifest: &[u8]) -> Result<String> {
    let pod: Pod = serde_yaml::from_slice(manifest)
        .map_err(|e| Error::invalid_manifest(e.to_string()))?;

    let mutated = injector.mutate(pod)?;

    serde_yaml::to_string(&mutated).map_err(|e| Error::serialization(e.to_string()))
}
