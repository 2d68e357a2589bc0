//! Turns a policy and its resolved credentials into a pipeline
//! configuration document.

use crate::secrets::ResolveSecrets;
use telemetry_export_controller_core::{
    pipeline::{
        component_id, AuthConfig, BatchParams, PipelineConfig, RequestParams, ScrapeQuery,
        SinkConfig, SourceConfig,
    },
    query::QueryExpr,
    TENANT_PROJECT_LABEL,
};
use telemetry_export_controller_k8s_api::{
    ExportPolicy, ResourceExt, SinkAuthentication, SinkTarget, SourceType,
};
use tracing::warn;

/// The upstream read path metric sources are scraped from.
#[derive(Clone, Debug)]
pub struct MetricsService {
    pub endpoint: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl MetricsService {
    fn auth(&self) -> Option<AuthConfig> {
        match (&self.username, &self.password) {
            (Some(user), Some(password)) => Some(AuthConfig::Basic {
                user: user.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

/// Compiles the artifact for one policy.
///
/// Partial-failure semantics: a source whose query does not parse, or a
/// sink whose credentials cannot be resolved, is logged and skipped without
/// failing the siblings. Validation at admission time makes these cases
/// rare, but a policy admitted before a secret was deleted can still hit
/// them.
pub async fn compile(
    policy: &ExportPolicy,
    tenant: &str,
    metrics: &MetricsService,
    secrets: &dyn ResolveSecrets,
) -> PipelineConfig {
    let namespace = policy.namespace().unwrap_or_default();
    let name = policy.name_any();
    let uid = policy.uid().unwrap_or_default();
    let id = |component: &str| component_id(tenant, &namespace, &name, &uid, component);

    let mut config = PipelineConfig::default();

    for source in &policy.spec.sources {
        let SourceType::Metrics(metric_source) = &source.source;
        let mut query = match QueryExpr::parse(&metric_source.metricsql) {
            Ok(query) => query,
            Err(error) => {
                warn!(%error, source = %source.name, "Skipping source with invalid query");
                continue;
            }
        };
        query.scope_to(TENANT_PROJECT_LABEL, tenant);
        config.sources.insert(
            id(&source.name),
            SourceConfig::PrometheusScrape {
                endpoints: vec![metrics.endpoint.clone()],
                auth: metrics.auth(),
                query: ScrapeQuery {
                    matches: vec![query.to_string()],
                },
            },
        );
    }

    for sink in &policy.spec.sinks {
        let SinkTarget::PrometheusRemoteWrite(prw) = &sink.target;
        let auth = match &prw.authentication {
            None => None,
            Some(SinkAuthentication::BasicAuth { secret_ref }) => {
                match secrets.resolve_basic_auth(&namespace, secret_ref).await {
                    Ok(auth) => Some(AuthConfig::Basic {
                        user: auth.username,
                        password: auth.password,
                    }),
                    Err(error) => {
                        warn!(%error, sink = %sink.name, "Skipping sink with unresolvable credentials");
                        continue;
                    }
                }
            }
            Some(SinkAuthentication::BearerToken { secret_ref }) => {
                match secrets.resolve_bearer_token(&namespace, secret_ref).await {
                    Ok(token) => Some(AuthConfig::Bearer { token }),
                    Err(error) => {
                        warn!(%error, sink = %sink.name, "Skipping sink with unresolvable credentials");
                        continue;
                    }
                }
            }
        };

        let batch = prw.batch.clone().unwrap_or_default();
        let retry = prw.retry.clone().unwrap_or_default();
        config.sinks.insert(
            id(&sink.name),
            SinkConfig::PrometheusRemoteWrite {
                inputs: sink.sources.iter().map(|s| id(s)).collect(),
                endpoint: prw.endpoint.clone(),
                auth,
                batch: BatchParams {
                    timeout_secs: batch.timeout.as_duration().as_secs(),
                    max_events: batch.max_size,
                },
                request: RequestParams {
                    retry_attempts: retry.max_attempts,
                    retry_initial_backoff_secs: retry.backoff_duration.as_duration().as_secs(),
                },
            },
        );
    }

    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::test_support::{basic_auth_secret, StaticSecrets};
    use telemetry_export_controller_k8s_api::{ExportPolicySpec, ObjectMeta};

    fn policy(spec: serde_json::Value) -> ExportPolicy {
        let spec: ExportPolicySpec = serde_json::from_value(spec).unwrap();
        let mut policy = ExportPolicy::new("policy", spec);
        policy.metadata = ObjectMeta {
            name: Some("policy".to_string()),
            namespace: Some("default".to_string()),
            uid: Some("uid-1".to_string()),
            ..Default::default()
        };
        policy
    }

    fn grafana_policy() -> ExportPolicy {
        policy(serde_json::json!({
            "sources": [{ "name": "metrics", "metrics": { "metricsql": r#"{job="my-job"}"# } }],
            "sinks": [{
                "name": "grafana",
                "sources": ["metrics"],
                "target": {
                    "prometheusRemoteWrite": {
                        "endpoint": "https://example.test/api/push",
                        "authentication": {
                            "basicAuth": { "secretRef": { "name": "grafana-auth" } },
                        },
                    },
                },
            }],
        }))
    }

    fn metrics_service() -> MetricsService {
        MetricsService {
            endpoint: "https://metrics.internal/federate".to_string(),
            username: Some("reader".to_string()),
            password: Some("hunter2".to_string()),
        }
    }

    #[tokio::test]
    async fn compiles_scoped_source_and_authenticated_sink() {
        let secrets =
            StaticSecrets::with("default", basic_auth_secret("grafana-auth", "writer", "pw"));
        let config = compile(&grafana_policy(), "proj-1", &metrics_service(), &secrets).await;

        let source_id = "export-policy:proj-1:default:policy:uid-1:metrics";
        let sink_id = "export-policy:proj-1:default:policy:uid-1:grafana";

        let SourceConfig::PrometheusScrape { query, .. } = &config.sources[source_id];
        assert_eq!(
            query.matches,
            vec![format!(
                r#"{{job="my-job", {TENANT_PROJECT_LABEL}="proj-1"}}"#
            )],
        );

        let SinkConfig::PrometheusRemoteWrite {
            inputs,
            endpoint,
            auth,
            ..
        } = &config.sinks[sink_id];
        assert_eq!(inputs, &vec![source_id.to_string()]);
        assert_eq!(endpoint, "https://example.test/api/push");
        assert_eq!(
            auth,
            &Some(AuthConfig::Basic {
                user: "writer".to_string(),
                password: "pw".to_string(),
            }),
        );
    }

    #[tokio::test]
    async fn query_without_filters_gains_the_tenant_filter() {
        let mut p = grafana_policy();
        let SourceType::Metrics(m) = &mut p.spec.sources[0].source;
        m.metricsql = "up".to_string();
        let secrets =
            StaticSecrets::with("default", basic_auth_secret("grafana-auth", "w", "p"));
        let config = compile(&p, "proj-1", &metrics_service(), &secrets).await;
        let SourceConfig::PrometheusScrape { query, .. } =
            config.sources.values().next().unwrap();
        assert_eq!(
            query.matches,
            vec![format!(r#"up{{{TENANT_PROJECT_LABEL}="proj-1"}}"#)],
        );
    }

    #[tokio::test]
    async fn missing_secret_skips_only_that_sink() {
        let config = compile(
            &grafana_policy(),
            "proj-1",
            &metrics_service(),
            &StaticSecrets::default(),
        )
        .await;
        assert_eq!(config.sources.len(), 1);
        assert!(config.sinks.is_empty());
    }

    #[tokio::test]
    async fn defaults_apply_when_batch_and_retry_are_absent() {
        let p = policy(serde_json::json!({
            "sources": [{ "name": "m", "metrics": { "metricsql": "up" } }],
            "sinks": [{
                "name": "s",
                "sources": ["m"],
                "target": { "prometheusRemoteWrite": { "endpoint": "https://example.test" } },
            }],
        }));
        let config = compile(&p, "proj-1", &metrics_service(), &StaticSecrets::default()).await;
        let SinkConfig::PrometheusRemoteWrite { batch, request, .. } =
            config.sinks.values().next().unwrap();
        assert_eq!(
            batch,
            &BatchParams {
                timeout_secs: 5,
                max_events: 500,
            },
        );
        assert_eq!(
            request,
            &RequestParams {
                retry_attempts: 3,
                retry_initial_backoff_secs: 5,
            },
        );
    }

    #[tokio::test]
    async fn compiling_twice_yields_identical_bytes() {
        let secrets =
            StaticSecrets::with("default", basic_auth_secret("grafana-auth", "w", "p"));
        let p = grafana_policy();
        let metrics = metrics_service();
        let a = compile(&p, "proj-1", &metrics, &secrets).await;
        let b = compile(&p, "proj-1", &metrics, &secrets).await;
        assert_eq!(
            a.to_pretty_json().unwrap(),
            b.to_pretty_json().unwrap(),
        );
    }
}
