//! The multi-cluster coordinator: one policy controller per engaged tenant
//! cluster, fed by that cluster's own watch streams.

use crate::{
    artifacts::ArtifactStore,
    compiler::MetricsService,
    reconciler::{self, Context},
    secrets::SecretStore,
};
use futures::StreamExt;
use kube::{
    api::Api,
    runtime::{controller::Controller, reflector::Store, watcher},
    Client,
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use telemetry_export_controller_k8s_api::{ExportPolicy, Secret};
use tokio::sync::oneshot;
use tracing::{debug, info, info_span, warn, Instrument};

/// A live, cache-synchronized connection to one tenant cluster.
#[derive(Clone)]
pub struct ClusterConnection {
    pub client: Client,
    pub policies: Store<ExportPolicy>,
}

#[derive(Debug, thiserror::Error)]
#[error("no engaged cluster {0:?}")]
pub struct NotEngaged(pub String);

pub struct Coordinator {
    metrics: MetricsService,
    artifacts: Arc<dyn ArtifactStore>,
    inner: Mutex<HashMap<String, Engaged>>,
}

struct Engaged {
    conn: ClusterConnection,
    // Dropping this stops the cluster's policy controller.
    _stop: oneshot::Sender<()>,
}

impl Coordinator {
    pub fn new(metrics: MetricsService, artifacts: Arc<dyn ArtifactStore>) -> Arc<Self> {
        Arc::new(Self {
            metrics,
            artifacts,
            inner: Mutex::new(HashMap::new()),
        })
    }

    /// Registers a cluster and starts reconciling its policies. Idempotent:
    /// engaging an already-engaged cluster key is a no-op, so callers may
    /// retry freely.
    pub fn engage(&self, cluster: &str, conn: ClusterConnection) {
        let mut inner = self.inner.lock();
        if inner.contains_key(cluster) {
            debug!(%cluster, "Cluster already engaged");
            return;
        }
        let (stop_tx, stop_rx) = oneshot::channel();
        let ctx = Arc::new(Context {
            tenant: cluster.to_string(),
            client: conn.client.clone(),
            secrets: Arc::new(SecretStore::new(conn.client.clone())),
            artifacts: self.artifacts.clone(),
            metrics: self.metrics.clone(),
        });
        tokio::spawn(
            run_policy_controller(conn.clone(), ctx, stop_rx)
                .instrument(info_span!("policies", %cluster)),
        );
        inner.insert(
            cluster.to_string(),
            Engaged {
                conn,
                _stop: stop_tx,
            },
        );
        info!(%cluster, "Engaged cluster");
    }

    /// Stops the cluster's policy controller and forgets the connection.
    pub fn disengage(&self, cluster: &str) {
        if self.inner.lock().remove(cluster).is_some() {
            info!(%cluster, "Disengaged cluster");
        }
    }

    pub fn get(&self, cluster: &str) -> Result<ClusterConnection, NotEngaged> {
        self.inner
            .lock()
            .get(cluster)
            .map(|e| e.conn.clone())
            .ok_or_else(|| NotEngaged(cluster.to_string()))
    }

    pub fn is_engaged(&self, cluster: &str) -> bool {
        self.inner.lock().contains_key(cluster)
    }
}

/// Runs the policy controller for one cluster until `stop` fires. Secret
/// changes re-enqueue the policies referencing them.
async fn run_policy_controller(
    conn: ClusterConnection,
    ctx: Arc<Context>,
    stop: oneshot::Receiver<()>,
) {
    let cluster = ctx.tenant.clone();
    let stopped = cluster.clone();
    let policies = Api::<ExportPolicy>::all(conn.client.clone());
    let secrets = Api::<Secret>::all(conn.client.clone());
    let store = conn.policies.clone();
    Controller::new(policies, watcher::Config::default())
        .watches(secrets, watcher::Config::default(), move |secret| {
            reconciler::policies_referencing_secret(&store, &secret)
        })
        .graceful_shutdown_on(async move {
            let _ = stop.await;
        })
        .run(reconciler::reconcile, reconciler::error_policy, ctx)
        .for_each(|result| {
            let cluster = cluster.clone();
            async move {
                match result {
                    Ok((object, _)) => debug!(%cluster, %object, "Reconciled"),
                    Err(error) => warn!(%cluster, %error, "Reconciler stream error"),
                }
            }
        })
        .await;
    info!(cluster = %stopped, "Policy controller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{ArtifactDeletion, PipelineArtifact};
    use kube::runtime::reflector;

    struct NullArtifacts;

    #[async_trait::async_trait]
    impl ArtifactStore for NullArtifacts {
        async fn apply(&self, _: &PipelineArtifact) -> anyhow::Result<()> {
            Ok(())
        }

        async fn delete(&self, _: &str) -> anyhow::Result<ArtifactDeletion> {
            Ok(ArtifactDeletion::NotFound)
        }
    }

    fn coordinator() -> Arc<Coordinator> {
        Coordinator::new(
            MetricsService {
                endpoint: "http://metrics.internal".to_string(),
                username: None,
                password: None,
            },
            Arc::new(NullArtifacts),
        )
    }

    fn connection() -> ClusterConnection {
        // The client never sees a request; these tests only exercise the
        // engagement map.
        let svc = tower::service_fn(|_: hyper::Request<kube::client::Body>| async {
            Ok::<_, std::convert::Infallible>(
                hyper::Response::builder()
                    .status(hyper::StatusCode::NOT_FOUND)
                    .body(kube::client::Body::empty())
                    .unwrap(),
            )
        });
        let client = Client::new(svc, "default");
        let (policies, _writer) = reflector::store();
        ClusterConnection { client, policies }
    }

    #[tokio::test]
    async fn engage_is_idempotent() {
        let coordinator = coordinator();
        assert!(!coordinator.is_engaged("proj-1"));
        coordinator.engage("proj-1", connection());
        assert!(coordinator.is_engaged("proj-1"));
        coordinator.engage("proj-1", connection());
        assert!(coordinator.get("proj-1").is_ok());
    }

    #[tokio::test]
    async fn disengage_forgets_the_cluster() {
        let coordinator = coordinator();
        coordinator.engage("proj-1", connection());
        coordinator.disengage("proj-1");
        assert!(!coordinator.is_engaged("proj-1"));
        assert!(matches!(
            coordinator.get("proj-1"),
            Err(NotEngaged(cluster)) if cluster == "proj-1",
        ));
        // Disengaging an unknown cluster is a no-op.
        coordinator.disengage("proj-2");
    }
}
