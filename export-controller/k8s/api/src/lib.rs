#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod conditions;
mod duration;
pub mod export_policy;
pub mod project;

pub use self::{
    duration::K8sDuration,
    export_policy::{
        Batch, ExportPolicy, ExportPolicySpec, ExportPolicyStatus, MetricSource,
        PrometheusRemoteWriteSink, Retry, SecretKeyReference, SecretReference,
        SinkAuthentication, SinkStatus, SinkTarget, SourceType, TelemetrySink, TelemetrySource,
    },
};
pub use k8s_openapi::{
    api::core::v1::Secret,
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
};
pub use kube::api::{ObjectMeta, ResourceExt};
