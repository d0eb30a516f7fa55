//! Admission review handling for Pod injection
//!
//! The admission body is decoded as `AdmissionReview<DynamicObject>` rather
//! than a typed Pod review on purpose: a Pod that fails to deserialize must
//! still produce a structured denial carrying the request UID. A typed
//! extractor would turn that into a bare 400 and the API server would report
//! an opaque webhook failure instead of the real reason.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use json_patch::{PatchOperation, ReplaceOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use tracing::{info, warn};

use super::WebhookState;
use crate::inject::Injector;

/// Handle a Pod admission review
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "invalid admission review");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = mutate_pod(&state.injector, &request);
    Json(response.into_review())
}

/// Run the engine over the admitted object and build the response
///
/// Every failure path is a denial tied to the request UID. The patch replaces
/// the whole `/spec`; with `reinvocationPolicy: IfNeeded` the engine may see
/// its own output again, which is safe because injection is a fixed point.
fn mutate_pod(injector: &Injector, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);

    let Some(object) = &request.object else {
        return response.deny("admission request has no object");
    };

    let pod: Pod = match serde_json::to_value(object).and_then(serde_json::from_value) {
        Ok(pod) => pod,
        Err(e) => return response.deny(format!("object is not a Pod: {}", e)),
    };

    let name = pod
        .metadata
        .name
        .clone()
        .or_else(|| pod.metadata.generate_name.clone())
        .unwrap_or_default();

    let mutated = match injector.mutate(pod) {
        Ok(mutated) => mutated,
        Err(e) => {
            warn!(pod = %name, error = %e, "injection denied");
            return response.deny(e.to_string());
        }
    };

    let spec = match serde_json::to_value(&mutated.spec) {
        Ok(spec) => spec,
        Err(e) => return response.deny(format!("failed to serialize mutated spec: {}", e)),
    };

    let patch = json_patch::Patch(vec![PatchOperation::Replace(ReplaceOperation {
        path: PointerBuf::from_tokens(["spec"]),
        value: spec,
    })]);

    match response.with_patch(patch) {
        Ok(response) => {
            info!(pod = %name, "sidecar injected");
            response
        }
        Err(e) => AdmissionResponse::invalid(format!("failed to attach patch: {}", e)),
    }
}
