//! The compiled pipeline configuration document handed to the downstream
//! data-movement agent.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Builds the globally unique ID for one source or sink instance. Stable
/// across reconciliations; unique across policies and tenants because the
/// policy UID participates.
pub fn component_id(
    tenant: &str,
    namespace: &str,
    name: &str,
    uid: &str,
    component: &str,
) -> String {
    format!("export-policy:{tenant}:{namespace}:{name}:{uid}:{component}")
}

/// The artifact document. Ordered maps keep serialization byte-stable so
/// recompiling an unchanged policy produces an identical artifact.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub sources: BTreeMap<String, SourceConfig>,
    pub sinks: BTreeMap<String, SinkConfig>,
}

impl PipelineConfig {
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty() && self.sinks.is_empty()
    }

    pub fn to_pretty_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    PrometheusScrape {
        endpoints: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        auth: Option<AuthConfig>,
        query: ScrapeQuery,
    },
}

/// Series selectors passed to the scrape endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScrapeQuery {
    #[serde(rename = "match[]")]
    pub matches: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkConfig {
    PrometheusRemoteWrite {
        inputs: Vec<String>,
        endpoint: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        auth: Option<AuthConfig>,
        batch: BatchParams,
        request: RequestParams,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum AuthConfig {
    Basic { user: String, password: String },
    Bearer { token: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchParams {
    pub timeout_secs: u64,
    pub max_events: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestParams {
    pub retry_attempts: u32,
    pub retry_initial_backoff_secs: u64,
}
