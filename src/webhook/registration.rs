//! Webhook registration with the API server
//!
//! Builds and applies the `MutatingWebhookConfiguration` that routes Pod
//! CREATE operations to the webhook service. Registration happens at startup
//! because the CA bundle changes on every boot; server-side apply makes the
//! re-registration idempotent.

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    WebhookClientConfig,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::info;

use crate::Result;

/// Name of the webhook configuration and of the fronting Service
pub const WEBHOOK_NAME: &str = "mca-webhook";

/// Namespace the webhook Service lives in
pub const WEBHOOK_NAMESPACE: &str = "default";

/// Pods opt in to injection with this label set to "true"
pub const INJECT_LABEL: &str = "mca.k8s.io/inject";

/// DNS names the webhook's serving certificate must cover
pub const WEBHOOK_DNS_NAMES: [&str; 4] = [
    "mca-webhook",
    "mca-webhook.default",
    "mca-webhook.default.svc",
    "mca-webhook.default.svc.cluster.local",
];

/// Build the `MutatingWebhookConfiguration` for the given CA bundle
///
/// Scope is deliberately narrow: CREATE on v1 Pods carrying the opt-in
/// label. `failurePolicy: Fail` because an uninjected pod would silently run
/// with direct API access. `reinvocationPolicy: IfNeeded` is safe because
/// the mutation is a fixed point on its own output.
pub fn webhook_configuration(ca_cert_pem: &str) -> MutatingWebhookConfiguration {
    MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(WEBHOOK_NAME.to_string()),
            ..Default::default()
        },
        webhooks: Some(vec![MutatingWebhook {
            name: format!("{}.{}.svc", WEBHOOK_NAME, WEBHOOK_NAMESPACE),
            admission_review_versions: vec!["v1".to_string(), "v1beta1".to_string()],
            side_effects: "None".to_string(),
            failure_policy: Some("Fail".to_string()),
            reinvocation_policy: Some("IfNeeded".to_string()),
            client_config: WebhookClientConfig {
                service: Some(ServiceReference {
                    name: WEBHOOK_NAME.to_string(),
                    namespace: WEBHOOK_NAMESPACE.to_string(),
                    path: Some("/mutate".to_string()),
                    port: Some(crate::WEBHOOK_PORT as i32),
                }),
                ca_bundle: Some(ByteString(ca_cert_pem.as_bytes().to_vec())),
                ..Default::default()
            },
            rules: Some(vec![RuleWithOperations {
                api_groups: Some(vec!["".to_string()]),
                api_versions: Some(vec!["v1".to_string()]),
                operations: Some(vec!["CREATE".to_string()]),
                resources: Some(vec!["pods".to_string()]),
                scope: Some("*".to_string()),
            }]),
            object_selector: Some(LabelSelector {
                match_labels: Some(
                    [(INJECT_LABEL.to_string(), "true".to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }]),
    }
}

/// Apply the webhook configuration via server-side apply
///
/// Force ownership so a previous boot's CA bundle is always overwritten.
pub async fn apply_webhook_configuration(client: Client, ca_cert_pem: &str) -> Result<()> {
    let api: Api<MutatingWebhookConfiguration> = Api::all(client);
    let config = webhook_configuration(ca_cert_pem);

    api.patch(
        WEBHOOK_NAME,
        &PatchParams::apply("mca-webhook").force(),
        &Patch::Apply(&config),
    )
    .await?;

    info!(name = WEBHOOK_NAME, "webhook configuration applied");
    Ok(())
}
