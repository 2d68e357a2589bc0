//! Pure structural and semantic validation of an `ExportPolicySpec`.
//!
//! Every problem is collected into a field-scoped list so a policy author
//! sees all of them in one admission response.

use crate::{query::QueryExpr, TENANT_PROJECT_LABEL};
use std::{collections::HashSet, fmt, time::Duration};
use telemetry_export_controller_k8s_api::{
    ExportPolicySpec, SinkTarget, SourceType, TelemetrySink, TelemetrySource,
};

const BATCH_TIMEOUT_MIN: Duration = Duration::from_secs(1);
const BATCH_TIMEOUT_MAX: Duration = Duration::from_secs(10);
const BATCH_MAX_SIZE_MIN: u32 = 1;
const BATCH_MAX_SIZE_MAX: u32 = 1000;
const RETRY_ATTEMPTS_MIN: u32 = 1;
const RETRY_ATTEMPTS_MAX: u32 = 5;
const RETRY_BACKOFF_MIN: Duration = Duration::from_secs(1);
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(10);

/// A single validation problem, scoped to the spec field that caused it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validates a policy spec, returning every problem found. An empty list
/// means the spec is valid.
///
/// Sink-to-source references are deliberately not checked here: a sink
/// naming an undeclared source compiles to a dangling input, which the
/// downstream agent ignores.
pub fn validate(spec: &ExportPolicySpec) -> Vec<FieldError> {
    let mut errors = Vec::new();

    if spec.sources.is_empty() {
        errors.push(FieldError::new(
            "spec.sources",
            "at least one source is required",
        ));
    }
    let mut source_names = HashSet::new();
    for (i, source) in spec.sources.iter().enumerate() {
        if !source_names.insert(source.name.as_str()) {
            errors.push(FieldError::new(
                format!("spec.sources[{i}].name"),
                format!("duplicate source name {:?}", source.name),
            ));
        }
        validate_source(i, source, &mut errors);
    }

    if spec.sinks.is_empty() {
        errors.push(FieldError::new(
            "spec.sinks",
            "at least one sink is required",
        ));
    }
    let mut sink_names = HashSet::new();
    for (i, sink) in spec.sinks.iter().enumerate() {
        if !sink_names.insert(sink.name.as_str()) {
            errors.push(FieldError::new(
                format!("spec.sinks[{i}].name"),
                format!("duplicate sink name {:?}", sink.name),
            ));
        }
        validate_sink(i, sink, &mut errors);
    }

    errors
}

fn validate_source(i: usize, source: &TelemetrySource, errors: &mut Vec<FieldError>) {
    let SourceType::Metrics(metrics) = &source.source;
    let field = format!("spec.sources[{i}].metrics.metricsql");
    let query = match QueryExpr::parse(&metrics.metricsql) {
        Ok(query) => query,
        Err(e) => {
            errors.push(FieldError::new(field, format!("invalid query: {e}")));
            return;
        }
    };
    if query
        .filters()
        .any(|f| f.label == TENANT_PROJECT_LABEL)
    {
        errors.push(FieldError::new(
            field,
            format!("the label {TENANT_PROJECT_LABEL:?} is reserved and may not be used in queries"),
        ));
    }
}

fn validate_sink(i: usize, sink: &TelemetrySink, errors: &mut Vec<FieldError>) {
    let SinkTarget::PrometheusRemoteWrite(prw) = &sink.target;
    let field = format!("spec.sinks[{i}].target.prometheusRemoteWrite");

    match prw.endpoint.parse::<http::Uri>() {
        Ok(uri) if uri.scheme().is_some() && uri.authority().is_some() => {}
        _ => errors.push(FieldError::new(
            format!("{field}.endpoint"),
            format!("{:?} is not an absolute URL", prw.endpoint),
        )),
    }

    if let Some(batch) = &prw.batch {
        let timeout = batch.timeout.as_duration();
        if !(BATCH_TIMEOUT_MIN..=BATCH_TIMEOUT_MAX).contains(&timeout) {
            errors.push(FieldError::new(
                format!("{field}.batch.timeout"),
                format!(
                    "must be between {BATCH_TIMEOUT_MIN:?} and {BATCH_TIMEOUT_MAX:?}, got {}",
                    batch.timeout
                ),
            ));
        }
        if !(BATCH_MAX_SIZE_MIN..=BATCH_MAX_SIZE_MAX).contains(&batch.max_size) {
            errors.push(FieldError::new(
                format!("{field}.batch.maxSize"),
                format!(
                    "must be between {BATCH_MAX_SIZE_MIN} and {BATCH_MAX_SIZE_MAX}, got {}",
                    batch.max_size
                ),
            ));
        }
    }

    if let Some(retry) = &prw.retry {
        if !(RETRY_ATTEMPTS_MIN..=RETRY_ATTEMPTS_MAX).contains(&retry.max_attempts) {
            errors.push(FieldError::new(
                format!("{field}.retry.maxAttempts"),
                format!(
                    "must be between {RETRY_ATTEMPTS_MIN} and {RETRY_ATTEMPTS_MAX}, got {}",
                    retry.max_attempts
                ),
            ));
        }
        let backoff = retry.backoff_duration.as_duration();
        if !(RETRY_BACKOFF_MIN..=RETRY_BACKOFF_MAX).contains(&backoff) {
            errors.push(FieldError::new(
                format!("{field}.retry.backoffDuration"),
                format!(
                    "must be between {RETRY_BACKOFF_MIN:?} and {RETRY_BACKOFF_MAX:?}, got {}",
                    retry.backoff_duration
                ),
            ));
        }
    }
}
