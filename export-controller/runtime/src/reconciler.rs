//! The per-policy reconciliation loop: finalization, status recomputation,
//! compilation, and artifact persistence.

use crate::{
    artifacts::{ArtifactStore, PipelineArtifact},
    compiler::{self, MetricsService},
    secrets::{ResolveSecrets, SecretError},
};
use kube::{
    api::{Api, Patch, PatchParams},
    runtime::{controller::Action, reflector::{ObjectRef, Store}},
    Client,
};
use std::{sync::Arc, time::Duration};
use telemetry_export_controller_k8s_api::{
    conditions::{self, new_condition, set_status_condition, STATUS_FALSE, STATUS_TRUE},
    export_policy::CONTROLLER_FINALIZER,
    ExportPolicy, ExportPolicyStatus, ResourceExt, Secret, SinkAuthentication, SinkStatus,
    SinkTarget, Time,
};
use tracing::{debug, info, warn};

pub const READY_CONDITION: &str = "Ready";
pub const ACCEPTED_CONDITION: &str = "Accepted";

pub const REASON_SINKS_ACCEPTED: &str = "SinksAccepted";
pub const REASON_SINKS_NOT_ACCEPTED: &str = "SinksNotAccepted";
pub const REASON_SINK_CONFIGURED: &str = "SinkConfigured";
pub const REASON_SECRET_NOT_FOUND: &str = "SecretNotFound";
pub const REASON_INVALID_AUTHENTICATION: &str = "InvalidAuthentication";

const ERROR_REQUEUE: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("api request failed: {0}")]
    Kube(#[from] kube::Error),

    #[error("secret lookup failed: {0}")]
    Secret(#[from] SecretError),

    #[error("artifact store failed: {0}")]
    Artifact(#[from] anyhow::Error),

    #[error("failed to serialize pipeline config: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("policy is missing its {0}")]
    MissingMetadata(&'static str),
}

/// Everything a reconciliation pass needs, scoped to one tenant cluster.
pub struct Context {
    /// Tenant identity used for component IDs and query scoping.
    pub tenant: String,
    /// Client for the cluster the policies live on.
    pub client: Client,
    pub secrets: Arc<dyn ResolveSecrets>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub metrics: MetricsService,
}

pub async fn reconcile(policy: Arc<ExportPolicy>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = policy
        .namespace()
        .ok_or(Error::MissingMetadata("namespace"))?;
    let name = policy.name_any();
    let api = Api::<ExportPolicy>::namespaced(ctx.client.clone(), &namespace);

    let has_finalizer = policy
        .finalizers()
        .iter()
        .any(|f| f == CONTROLLER_FINALIZER);

    if policy.metadata.deletion_timestamp.is_some() {
        if has_finalizer {
            let uid = policy.uid().ok_or(Error::MissingMetadata("uid"))?;
            finalize(&uid, &*ctx.artifacts).await?;
            let finalizers = policy
                .finalizers()
                .iter()
                .filter(|f| *f != CONTROLLER_FINALIZER)
                .cloned()
                .collect::<Vec<_>>();
            patch_finalizers(&api, &name, finalizers).await?;
            info!(%namespace, %name, "Finalized deleted policy");
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer {
        let mut finalizers = policy.finalizers().to_vec();
        finalizers.push(CONTROLLER_FINALIZER.to_string());
        patch_finalizers(&api, &name, finalizers).await?;
        // The update generates a watch event that drives the next pass.
        return Ok(Action::await_change());
    }

    let checks = check_sinks(&policy, &*ctx.secrets).await?;
    let (status, changed) = build_status(&policy, &checks, conditions::now());
    if changed {
        api.patch_status(
            &name,
            &PatchParams::default(),
            &Patch::Merge(serde_json::json!({ "status": status })),
        )
        .await?;
        debug!(%namespace, %name, "Updated policy status");
        return Ok(Action::requeue(Duration::ZERO));
    }

    let uid = policy.uid().ok_or(Error::MissingMetadata("uid"))?;
    let config = compiler::compile(&policy, &ctx.tenant, &ctx.metrics, &*ctx.secrets).await;
    let artifact = PipelineArtifact {
        policy_uid: uid,
        policy_name: name.clone(),
        policy_namespace: namespace.clone(),
        config_json: config.to_pretty_json()?,
    };
    ctx.artifacts.apply(&artifact).await?;
    debug!(%namespace, %name, "Published pipeline config");

    Ok(Action::await_change())
}

pub fn error_policy(policy: Arc<ExportPolicy>, error: &Error, _: Arc<Context>) -> Action {
    warn!(
        namespace = %policy.namespace().unwrap_or_default(),
        name = %policy.name_any(),
        %error,
        "Reconciliation failed",
    );
    Action::requeue(ERROR_REQUEUE)
}

/// Deletes the downstream artifact for a policy being removed. An artifact
/// that is already gone counts as successful cleanup.
async fn finalize(uid: &str, artifacts: &dyn ArtifactStore) -> anyhow::Result<()> {
    artifacts.delete(uid).await.map(|_| ())
}

async fn patch_finalizers(
    api: &Api<ExportPolicy>,
    name: &str,
    finalizers: Vec<String>,
) -> Result<(), Error> {
    api.patch_metadata(
        name,
        &PatchParams::default(),
        &Patch::Merge(serde_json::json!({ "metadata": { "finalizers": finalizers } })),
    )
    .await?;
    Ok(())
}

/// The outcome of checking one sink's prerequisites.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkCheck {
    Accepted,
    Rejected {
        reason: &'static str,
        message: String,
    },
}

/// Verifies that every sink's referenced secret exists and has the expected
/// shape. Transient store failures abort the pass; shape problems and
/// absent secrets are reported per sink.
async fn check_sinks(
    policy: &ExportPolicy,
    secrets: &dyn ResolveSecrets,
) -> Result<Vec<(String, SinkCheck)>, Error> {
    let namespace = policy.namespace().unwrap_or_default();
    let mut checks = Vec::with_capacity(policy.spec.sinks.len());
    for sink in &policy.spec.sinks {
        let SinkTarget::PrometheusRemoteWrite(prw) = &sink.target;
        let result = match &prw.authentication {
            None => Ok(()),
            Some(SinkAuthentication::BasicAuth { secret_ref }) => secrets
                .resolve_basic_auth(&namespace, secret_ref)
                .await
                .map(|_| ()),
            Some(SinkAuthentication::BearerToken { secret_ref }) => secrets
                .resolve_bearer_token(&namespace, secret_ref)
                .await
                .map(|_| ()),
        };
        let check = match result {
            Ok(()) => SinkCheck::Accepted,
            Err(e) if e.is_transient() => return Err(e.into()),
            Err(e) if e.is_not_found() => SinkCheck::Rejected {
                reason: REASON_SECRET_NOT_FOUND,
                message: e.to_string(),
            },
            Err(e) => SinkCheck::Rejected {
                reason: REASON_INVALID_AUTHENTICATION,
                message: e.to_string(),
            },
        };
        checks.push((sink.name.clone(), check));
    }
    Ok(checks)
}

/// Recomputes the full status from this pass's sink checks.
///
/// Pure: the caller supplies the timestamp, and the returned flag reports
/// whether anything differs from the stored status so unchanged statuses
/// are never patched.
pub fn build_status(
    policy: &ExportPolicy,
    checks: &[(String, SinkCheck)],
    timestamp: Time,
) -> (ExportPolicyStatus, bool) {
    let mut status = policy.status.clone().unwrap_or_default();
    let generation = policy.metadata.generation;
    let mut changed = false;

    let before = status.sinks.len();
    status
        .sinks
        .retain(|s| checks.iter().any(|(name, _)| *name == s.name));
    changed |= status.sinks.len() != before;

    let mut accepted = 0;
    for (name, check) in checks {
        let condition = match check {
            SinkCheck::Accepted => {
                accepted += 1;
                new_condition(
                    ACCEPTED_CONDITION,
                    STATUS_TRUE,
                    REASON_SINK_CONFIGURED,
                    "Sink is configured",
                    generation,
                    timestamp.clone(),
                )
            }
            SinkCheck::Rejected { reason, message } => new_condition(
                ACCEPTED_CONDITION,
                STATUS_FALSE,
                reason,
                message,
                generation,
                timestamp.clone(),
            ),
        };
        let idx = match status.sinks.iter().position(|s| s.name == *name) {
            Some(idx) => idx,
            None => {
                status.sinks.push(SinkStatus {
                    name: name.clone(),
                    conditions: vec![],
                });
                changed = true;
                status.sinks.len() - 1
            }
        };
        changed |= set_status_condition(&mut status.sinks[idx].conditions, condition);
    }

    let total = checks.len();
    let message =
        format!("{accepted}/{total} sinks are accepted. Check the status of the sinks for more details.");
    let ready = if accepted == total {
        new_condition(
            READY_CONDITION,
            STATUS_TRUE,
            REASON_SINKS_ACCEPTED,
            message,
            generation,
            timestamp,
        )
    } else {
        new_condition(
            READY_CONDITION,
            STATUS_FALSE,
            REASON_SINKS_NOT_ACCEPTED,
            message,
            generation,
            timestamp,
        )
    };
    changed |= set_status_condition(&mut status.conditions, ready);

    (status, changed)
}

/// Maps a changed secret to the policies in its namespace whose sink
/// authentication references it, so the controller re-reconciles them.
pub fn policies_referencing_secret(
    store: &Store<ExportPolicy>,
    secret: &Secret,
) -> Vec<ObjectRef<ExportPolicy>> {
    let (Some(name), Some(namespace)) = (
        secret.metadata.name.as_deref(),
        secret.metadata.namespace.as_deref(),
    ) else {
        return vec![];
    };
    store
        .state()
        .iter()
        .filter(|p| p.namespace().as_deref() == Some(namespace))
        .filter(|p| p.spec.sinks.iter().any(|s| s.references_secret(name)))
        .map(|p| ObjectRef::from_obj(&**p))
        .collect()
}
