//! Admission webhook validating export policies and defaulting their
//! batch/retry parameters.

use anyhow::{anyhow, Result};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::{core::DynamicObject, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use telemetry_export_controller_core::validation;
use telemetry_export_controller_k8s_api::{
    Batch, ExportPolicy, ExportPolicySpec, Retry, SinkTarget,
};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Clone, Default)]
pub struct Admission {}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type Review = kube::core::admission::AdmissionReview<DynamicObject>;
type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;

type Body = http_body_util::Full<bytes::Bytes>;

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        if req.method() != http::Method::POST || req.uri().path() != "/" {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        }

        let admission = self.clone();
        Box::pin(async move {
            use bytes::Buf;
            let bytes = req.into_body().collect().await?.to_bytes();
            let review: Review = match serde_json::from_reader(bytes.reader()) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => {
                    debug!(?req);
                    admission.admit(req)
                }
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(?rsp);
            json_response(rsp.into_review())
        })
    }
}

impl Admission {
    pub fn new() -> Self {
        Self {}
    }

    fn admit(self, req: AdmissionRequest) -> AdmissionResponse {
        if !is_kind::<ExportPolicy>(&req) {
            return AdmissionResponse::invalid(format_args!(
                "unsupported resource type: {}.{}.{}",
                req.kind.group, req.kind.version, req.kind.kind
            ));
        }

        let rsp = AdmissionResponse::from(&req);
        let (obj, spec) = match parse_spec::<ExportPolicySpec>(req) {
            Ok(spec) => spec,
            Err(error) => {
                info!(%error, "Failed to parse ExportPolicy spec");
                return rsp.deny(error);
            }
        };

        let ns = obj.namespace().unwrap_or_default();
        let name = obj.name_any();

        let errors = validation::validate(&spec);
        if !errors.is_empty() {
            let message = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            info!(%ns, %name, %message, "Denied");
            return rsp.deny(message);
        }

        match default_patch(&spec) {
            Ok(None) => rsp,
            Ok(Some(patch)) => match rsp.with_patch(patch) {
                Ok(rsp) => rsp,
                Err(error) => AdmissionResponse::invalid(error),
            },
            Err(error) => AdmissionResponse::invalid(error),
        }
    }
}

/// Builds the JSON patch filling in default batch and retry parameters for
/// sinks that omit them. Returns `None` when nothing needs defaulting.
fn default_patch(spec: &ExportPolicySpec) -> serde_json::Result<Option<json_patch::Patch>> {
    let mut ops = Vec::new();
    for (i, sink) in spec.sinks.iter().enumerate() {
        let SinkTarget::PrometheusRemoteWrite(prw) = &sink.target;
        let prefix = format!("/spec/sinks/{i}/target/prometheusRemoteWrite");
        if prw.batch.is_none() {
            ops.push(serde_json::json!({
                "op": "add",
                "path": format!("{prefix}/batch"),
                "value": Batch::default(),
            }));
        }
        if prw.retry.is_none() {
            ops.push(serde_json::json!({
                "op": "add",
                "path": format!("{prefix}/retry"),
                "value": Retry::default(),
            }));
        }
    }
    if ops.is_empty() {
        return Ok(None);
    }
    serde_json::from_value(serde_json::Value::Array(ops)).map(Some)
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    req.kind.group.eq_ignore_ascii_case(&T::group(&dt))
        && req.kind.kind.eq_ignore_ascii_case(&T::kind(&dt))
}

fn json_response(rsp: Review) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}

fn parse_spec<T: DeserializeOwned>(req: AdmissionRequest) -> Result<(DynamicObject, T)> {
    let obj = req
        .object
        .ok_or_else(|| anyhow!("admission request missing 'object'"))?;

    let spec = {
        let data = obj
            .data
            .get("spec")
            .cloned()
            .ok_or_else(|| anyhow!("admission request missing 'spec'"))?;
        serde_json::from_value(data)?
    };

    Ok((obj, spec))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(json: serde_json::Value) -> ExportPolicySpec {
        serde_json::from_value(json).unwrap()
    }

    fn sink(extra: serde_json::Value) -> serde_json::Value {
        let mut prw = serde_json::json!({ "endpoint": "https://example.test/api/push" });
        prw.as_object_mut()
            .unwrap()
            .extend(extra.as_object().unwrap().clone());
        serde_json::json!({
            "name": "grafana",
            "sources": ["metrics"],
            "target": { "prometheusRemoteWrite": prw },
        })
    }

    #[test]
    fn defaults_absent_batch_and_retry() {
        let s = spec(serde_json::json!({
            "sources": [{ "name": "metrics", "metrics": { "metricsql": "up" } }],
            "sinks": [sink(serde_json::json!({}))],
        }));
        let patch = default_patch(&s).unwrap().unwrap();
        let value = serde_json::to_value(&patch).unwrap();
        assert_eq!(
            value,
            serde_json::json!([
                {
                    "op": "add",
                    "path": "/spec/sinks/0/target/prometheusRemoteWrite/batch",
                    "value": { "timeout": "5s", "maxSize": 500 },
                },
                {
                    "op": "add",
                    "path": "/spec/sinks/0/target/prometheusRemoteWrite/retry",
                    "value": { "maxAttempts": 3, "backoffDuration": "5s" },
                },
            ]),
        );
    }

    #[test]
    fn fully_specified_sinks_need_no_patch() {
        let s = spec(serde_json::json!({
            "sources": [{ "name": "metrics", "metrics": { "metricsql": "up" } }],
            "sinks": [sink(serde_json::json!({
                "batch": { "timeout": "2s", "maxSize": 100 },
                "retry": { "maxAttempts": 2, "backoffDuration": "2s" },
            }))],
        }));
        assert!(default_patch(&s).unwrap().is_none());
    }

    #[test]
    fn denies_invalid_specs() {
        let review: Review = serde_json::from_value(serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "req-1",
                "kind": {
                    "group": "telemetry.tenantops.dev",
                    "version": "v1alpha1",
                    "kind": "ExportPolicy",
                },
                "resource": {
                    "group": "telemetry.tenantops.dev",
                    "version": "v1alpha1",
                    "resource": "exportpolicies",
                },
                "operation": "CREATE",
                "userInfo": {},
                "object": {
                    "apiVersion": "telemetry.tenantops.dev/v1alpha1",
                    "kind": "ExportPolicy",
                    "metadata": { "name": "policy", "namespace": "default" },
                    "spec": {
                        "sources": [{ "name": "m", "metrics": { "metricsql": "up" } }],
                        "sinks": [{
                            "name": "s",
                            "sources": ["m"],
                            "target": { "prometheusRemoteWrite": { "endpoint": "not a url" } },
                        }],
                    },
                },
            },
        }))
        .unwrap();
        let req: AdmissionRequest = review.try_into().unwrap();
        let rsp = Admission::new().admit(req);
        assert!(!rsp.allowed);
    }

    #[test]
    fn allows_and_patches_valid_specs() {
        let review: Review = serde_json::from_value(serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "req-1",
                "kind": {
                    "group": "telemetry.tenantops.dev",
                    "version": "v1alpha1",
                    "kind": "ExportPolicy",
                },
                "resource": {
                    "group": "telemetry.tenantops.dev",
                    "version": "v1alpha1",
                    "resource": "exportpolicies",
                },
                "operation": "CREATE",
                "userInfo": {},
                "object": {
                    "apiVersion": "telemetry.tenantops.dev/v1alpha1",
                    "kind": "ExportPolicy",
                    "metadata": { "name": "policy", "namespace": "default" },
                    "spec": {
                        "sources": [{ "name": "m", "metrics": { "metricsql": "up" } }],
                        "sinks": [{
                            "name": "s",
                            "sources": ["m"],
                            "target": {
                                "prometheusRemoteWrite": { "endpoint": "https://example.test" },
                            },
                        }],
                    },
                },
            },
        }))
        .unwrap();
        let req: AdmissionRequest = review.try_into().unwrap();
        let rsp = Admission::new().admit(req);
        assert!(rsp.allowed);
        assert!(rsp.patch.is_some());
    }
}
