use crate::K8sDuration;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Label domain for metadata stamped onto downstream objects owned by an
/// export policy.
pub const EXPORT_POLICY_LABEL_DOMAIN: &str = "exportpolicy.telemetry.tenantops.dev";

/// Correlation labels set on the downstream pipeline-config artifact.
pub const POLICY_NAME_LABEL: &str = "exportpolicy.telemetry.tenantops.dev/name";
pub const POLICY_NAMESPACE_LABEL: &str = "exportpolicy.telemetry.tenantops.dev/namespace";

/// Finalizer ensuring the downstream pipeline-config artifact is deleted
/// before an ExportPolicy is removed from the store.
pub const CONTROLLER_FINALIZER: &str = "exportpolicy.telemetry.tenantops.dev/controller";

/// Declares telemetry sources and the third-party sinks they are published
/// to. Telemetry matching multiple sources is not de-duplicated.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "telemetry.tenantops.dev",
    version = "v1alpha1",
    kind = "ExportPolicy",
    status = "ExportPolicyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ExportPolicySpec {
    pub sources: Vec<TelemetrySource>,
    pub sinks: Vec<TelemetrySink>,
}

/// A named origin of telemetry data within a policy.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySource {
    /// Unique within the policy; a valid DNS label.
    pub name: String,

    #[serde(flatten)]
    pub source: SourceType,
}

/// Supported source kinds. Adding a variant forces the validator and the
/// compiler to handle it.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum SourceType {
    Metrics(MetricSource),
}

/// Selects metric data with a label-filter query, e.g.
/// `{service_name="gateway", resource_kind="Gateway"}`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricSource {
    pub metricsql: String,
}

/// A named destination telemetry is published to.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySink {
    /// Unique within the policy; a valid DNS label.
    pub name: String,

    /// Names of declared sources feeding this sink.
    pub sources: Vec<String>,

    pub target: SinkTarget,
}

/// Supported sink target protocols. Exactly one protocol per sink.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum SinkTarget {
    PrometheusRemoteWrite(PrometheusRemoteWriteSink),
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusRemoteWriteSink {
    /// HTTP endpoint telemetry is pushed to.
    pub endpoint: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<SinkAuthentication>,

    /// Defaulted at admission time when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<Batch>,

    /// Defaulted at admission time when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<Retry>,
}

/// How the sink authenticates with its endpoint.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum SinkAuthentication {
    /// Secret must be of type `kubernetes.io/basic-auth`.
    #[serde(rename_all = "camelCase")]
    BasicAuth { secret_ref: SecretReference },

    /// Token is read from the named key of the referenced secret.
    #[serde(rename_all = "camelCase")]
    BearerToken { secret_ref: SecretKeyReference },
}

/// References a secret in the same namespace as the policy.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyReference {
    pub name: String,
    pub key: String,
}

/// Batching applied before requests are published to the endpoint.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    /// Batch timeout before sending telemetry, e.g. `5s`.
    pub timeout: K8sDuration,
    /// Maximum number of telemetry entries per batch.
    pub max_size: u32,
}

impl Default for Batch {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5).into(),
            max_size: 500,
        }
    }
}

/// Retry behavior when publishing to the endpoint fails.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Retry {
    /// Attempts before telemetry data is dropped.
    pub max_attempts: u32,
    /// Backoff between attempts, e.g. `5s`.
    pub backoff_duration: K8sDuration,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_duration: Duration::from_secs(5).into(),
        }
    }
}

/// Derived state; recomputed in full on every reconciliation pass.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExportPolicyStatus {
    /// Summary conditions for the policy as a whole. Known types: `Ready`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// One entry per configured sink.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sinks: Vec<SinkStatus>,
}

/// Status of a single configured sink. Known condition types: `Accepted`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SinkStatus {
    /// Name of the corresponding sink in the policy spec.
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl TelemetrySink {
    /// Whether this sink's authentication references the named secret.
    pub fn references_secret(&self, secret_name: &str) -> bool {
        let SinkTarget::PrometheusRemoteWrite(prw) = &self.target;
        match &prw.authentication {
            Some(SinkAuthentication::BasicAuth { secret_ref }) => secret_ref.name == secret_name,
            Some(SinkAuthentication::BearerToken { secret_ref }) => secret_ref.name == secret_name,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> serde_json::Value {
        serde_json::json!({
            "sources": [{
                "name": "metrics",
                "metrics": { "metricsql": r#"{job="my-job"}"# },
            }],
            "sinks": [{
                "name": "grafana",
                "sources": ["metrics"],
                "target": {
                    "prometheusRemoteWrite": {
                        "endpoint": "https://example.test/api/push",
                        "authentication": {
                            "basicAuth": { "secretRef": { "name": "grafana-auth" } },
                        },
                        "batch": { "timeout": "5s", "maxSize": 500 },
                        "retry": { "maxAttempts": 3, "backoffDuration": "5s" },
                    },
                },
            }],
        })
    }

    #[test]
    fn deserializes_spec_shape() {
        let spec: ExportPolicySpec = serde_json::from_value(sample()).unwrap();
        assert_eq!(spec.sources.len(), 1);
        let SourceType::Metrics(metrics) = &spec.sources[0].source;
        assert_eq!(metrics.metricsql, r#"{job="my-job"}"#);

        let SinkTarget::PrometheusRemoteWrite(prw) = &spec.sinks[0].target;
        assert_eq!(prw.endpoint, "https://example.test/api/push");
        assert_eq!(prw.batch, Some(Batch::default()));
        assert_eq!(prw.retry, Some(Retry::default()));
        assert!(spec.sinks[0].references_secret("grafana-auth"));
        assert!(!spec.sinks[0].references_secret("other"));
    }

    #[test]
    fn spec_roundtrips_through_json() {
        let spec: ExportPolicySpec = serde_json::from_value(sample()).unwrap();
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value, sample());
    }

    #[test]
    fn batch_and_retry_are_optional() {
        let spec: ExportPolicySpec = serde_json::from_value(serde_json::json!({
            "sources": [{ "name": "m", "metrics": { "metricsql": "up" } }],
            "sinks": [{
                "name": "s",
                "sources": ["m"],
                "target": { "prometheusRemoteWrite": { "endpoint": "https://example.test" } },
            }],
        }))
        .unwrap();
        let SinkTarget::PrometheusRemoteWrite(prw) = &spec.sinks[0].target;
        assert!(prw.batch.is_none());
        assert!(prw.retry.is_none());
        assert!(prw.authentication.is_none());
    }
}
