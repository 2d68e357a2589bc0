//! Typed access to tenant project control planes.
//!
//! Projects are served by a different control plane than the one this
//! controller is compiled against, so they are watched as `DynamicObject`s.
//! All decoding of that untyped data happens here.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{
    api::{ApiResource, DynamicObject},
    core::GroupVersionKind,
};

pub const PROJECT_GROUP: &str = "resourcemanager.tenantops.dev";
pub const PROJECT_VERSION: &str = "v1alpha1";
pub const PROJECT_KIND: &str = "Project";

/// Condition type reporting that a project's control plane is serving.
pub const CONTROL_PLANE_READY: &str = "ControlPlaneReady";

/// The API resource descriptor used to watch projects dynamically.
pub fn project_api_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        PROJECT_GROUP,
        PROJECT_VERSION,
        PROJECT_KIND,
    ))
}

/// Extracts the status conditions of a project.
///
/// Entries that do not decode as a `metav1.Condition` are skipped rather
/// than failing the whole list.
pub fn conditions(project: &DynamicObject) -> Vec<Condition> {
    project
        .data
        .pointer("/status/conditions")
        .and_then(|cs| cs.as_array())
        .map(|cs| {
            cs.iter()
                .filter_map(|c| serde_json::from_value(c.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Whether the project's control plane is ready to serve requests.
pub fn is_control_plane_ready(project: &DynamicObject) -> bool {
    crate::conditions::is_condition_true(&conditions(project), CONTROL_PLANE_READY)
}
