//! Pure compilation logic for export policies: query parsing and tenant
//! scoping, spec validation, and pipeline configuration assembly. Nothing in
//! this crate talks to the network.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod pipeline;
pub mod query;
pub mod validation;

/// Metric label that scopes telemetry to the tenant project it came from.
///
/// The compiler injects this label into every query and the validator
/// rejects policies that try to set it themselves.
pub const TENANT_PROJECT_LABEL: &str = "resourcemanager_tenantops_dev_project_name";
