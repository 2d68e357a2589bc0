//! Persistence of compiled pipeline configurations as downstream secrets
//! discoverable by the data-movement agent.

use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::ErrorResponse,
};
use std::collections::BTreeMap;
use telemetry_export_controller_k8s_api::{
    export_policy::{POLICY_NAMESPACE_LABEL, POLICY_NAME_LABEL},
    ObjectMeta, Secret,
};

const FIELD_MANAGER: &str = "telemetry-export-controller";

/// The downstream object name for a policy's artifact.
pub fn artifact_name(policy_uid: &str) -> String {
    format!("export-policy-pipeline-config-{policy_uid}")
}

/// One compiled artifact, ready to persist.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineArtifact {
    pub policy_uid: String,
    pub policy_name: String,
    pub policy_namespace: String,
    pub config_json: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArtifactDeletion {
    Deleted,
    /// The artifact was already gone. Cleanup is idempotent, so this is a
    /// success.
    NotFound,
}

#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn apply(&self, artifact: &PipelineArtifact) -> anyhow::Result<()>;

    async fn delete(&self, policy_uid: &str) -> anyhow::Result<ArtifactDeletion>;
}

/// Writes artifacts into a fixed namespace of the downstream cluster,
/// labeled so the data-movement agent's watch can discover them.
pub struct DownstreamSecrets {
    api: Api<Secret>,
    discovery_label: (String, String),
}

impl DownstreamSecrets {
    pub fn new(api: Api<Secret>, discovery_label: (String, String)) -> Self {
        Self {
            api,
            discovery_label,
        }
    }
}

fn render(discovery_label: &(String, String), artifact: &PipelineArtifact) -> Secret {
    let (key, value) = discovery_label;
    let labels = BTreeMap::from([
        (key.clone(), value.clone()),
        (POLICY_NAME_LABEL.to_string(), artifact.policy_name.clone()),
        (
            POLICY_NAMESPACE_LABEL.to_string(),
            artifact.policy_namespace.clone(),
        ),
    ]);
    Secret {
        metadata: ObjectMeta {
            name: Some(artifact_name(&artifact.policy_uid)),
            labels: Some(labels),
            ..Default::default()
        },
        string_data: Some(BTreeMap::from([(
            format!("{}.json", artifact.policy_uid),
            artifact.config_json.clone(),
        )])),
        ..Default::default()
    }
}

#[async_trait::async_trait]
impl ArtifactStore for DownstreamSecrets {
    async fn apply(&self, artifact: &PipelineArtifact) -> anyhow::Result<()> {
        let secret = render(&self.discovery_label, artifact);
        let name = artifact_name(&artifact.policy_uid);
        self.api
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&secret),
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, policy_uid: &str) -> anyhow::Result<ArtifactDeletion> {
        let name = artifact_name(policy_uid);
        match self.api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => Ok(ArtifactDeletion::Deleted),
            Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => {
                Ok(ArtifactDeletion::NotFound)
            }
            Err(e) => Err(e.into()),
        }
    }
}
