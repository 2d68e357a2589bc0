//! Tenant cluster discovery: watches project resources on the upstream
//! control plane and engages a connection for every project whose control
//! plane reports ready.

use crate::multicluster::{ClusterConnection, Coordinator};
use futures::prelude::*;
use kube::{
    api::{Api, DynamicObject},
    runtime::{reflector, watcher, WatchStreamExt},
    Client,
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use telemetry_export_controller_k8s_api::{project, ExportPolicy};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Delay before retrying a project while the coordinator is not yet
/// running.
const COORDINATOR_RETRY: Duration = Duration::from_secs(2);

/// Delay before retrying a project after a failed pass.
const ERROR_RETRY: Duration = Duration::from_secs(10);

const QUEUE_DEPTH: usize = 64;

#[derive(Clone, Debug)]
pub struct ProviderSettings {
    /// Endpoint template for tenant control planes; `{uid}` is replaced
    /// with the project's UID.
    pub url_template: String,
    pub cache_sync_timeout: Duration,
}

impl ProviderSettings {
    fn endpoint_for(&self, uid: &str) -> String {
        self.url_template.replace("{uid}", uid)
    }
}

/// Opens a client against a tenant control plane endpoint.
#[async_trait::async_trait]
pub trait ConnectCluster: Send + Sync {
    async fn connect(&self, endpoint: &str) -> anyhow::Result<Client>;
}

/// Connects by rebasing a template client configuration onto the tenant's
/// endpoint, reusing the local credentials and TLS settings.
pub struct KubeConnect {
    base: kube::Config,
}

impl KubeConnect {
    pub fn new(base: kube::Config) -> Self {
        Self { base }
    }
}

#[async_trait::async_trait]
impl ConnectCluster for KubeConnect {
    async fn connect(&self, endpoint: &str) -> anyhow::Result<Client> {
        let mut config = self.base.clone();
        config.cluster_url = endpoint.parse()?;
        Ok(Client::try_from(config)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("api request failed: {0}")]
    Kube(#[from] kube::Error),

    #[error("failed to connect to cluster at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("timed out waiting for the policy cache to sync")]
    CacheSync,

    #[error("project {0:?} has no UID")]
    MissingUid(String),
}

#[derive(Debug)]
enum Outcome {
    Done,
    RequeueAfter(Duration),
}

pub struct ClusterProvider {
    connect: Arc<dyn ConnectCluster>,
    settings: ProviderSettings,
    inner: Mutex<State>,
}

struct State {
    coordinator: Option<Arc<Coordinator>>,
    connections: HashMap<String, ConnectionEntry>,
}

struct ConnectionEntry {
    conn: ClusterConnection,
    // Dropping this cancels the connection's policy reflector task.
    _stop: oneshot::Sender<()>,
}

impl ClusterProvider {
    pub fn new(connect: Arc<dyn ConnectCluster>, settings: ProviderSettings) -> Arc<Self> {
        Arc::new(Self {
            connect,
            settings,
            inner: Mutex::new(State {
                coordinator: None,
                connections: HashMap::new(),
            }),
        })
    }

    /// The live connection for a cluster key, if one is engaged.
    pub fn get(&self, cluster: &str) -> Option<ClusterConnection> {
        self.inner
            .lock()
            .connections
            .get(cluster)
            .map(|e| e.conn.clone())
    }

    /// Watches projects on the upstream control plane and reconciles each
    /// key until shutdown is signaled. All engaged connections are torn
    /// down on exit.
    pub async fn run(
        self: Arc<Self>,
        coordinator: Arc<Coordinator>,
        upstream: Client,
        shutdown: drain::Watch,
    ) {
        self.inner.lock().coordinator = Some(coordinator.clone());

        let api: Api<DynamicObject> =
            Api::all_with(upstream, &project::project_api_resource());
        let (tx, mut rx) = mpsc::channel::<String>(QUEUE_DEPTH);

        let watch_tx = tx.clone();
        let watch_api = api.clone();
        let watch = async move {
            let projects =
                watcher::watcher(watch_api, watcher::Config::default()).default_backoff();
            futures::pin_mut!(projects);
            while let Some(event) = projects.next().await {
                match event {
                    Ok(event) => {
                        if let Some(key) = event_key(event) {
                            if watch_tx.send(key).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(error) => warn!(%error, "Project watch failed"),
                }
            }
        };
        tokio::pin!(watch);
        let mut shutdown = std::pin::pin!(shutdown.signaled());

        loop {
            tokio::select! {
                _ = &mut watch => break,
                _ = &mut shutdown => {
                    info!("Shutting down project discovery");
                    break;
                }
                Some(key) = rx.recv() => {
                    match self.reconcile(&api, &key).await {
                        Ok(Outcome::Done) => {}
                        Ok(Outcome::RequeueAfter(delay)) => requeue(tx.clone(), key, delay),
                        Err(error) => {
                            warn!(cluster = %key, %error, "Project reconciliation failed");
                            requeue(tx.clone(), key, ERROR_RETRY);
                        }
                    }
                }
            }
        }

        let drained = {
            let mut state = self.inner.lock();
            state.connections.drain().collect::<Vec<_>>()
        };
        for (cluster, _entry) in drained {
            coordinator.disengage(&cluster);
        }
    }

    /// One pass for one project key. Fetches the current project state and
    /// converges the connection set toward it.
    async fn reconcile(
        &self,
        api: &Api<DynamicObject>,
        key: &str,
    ) -> Result<Outcome, ProviderError> {
        let Some(found) = api.get_opt(key).await? else {
            // Normal steady-state cleanup of a deleted project.
            self.remove(key);
            return Ok(Outcome::Done);
        };

        let coordinator = {
            let state = self.inner.lock();
            match &state.coordinator {
                Some(c) => c.clone(),
                None => return Ok(Outcome::RequeueAfter(COORDINATOR_RETRY)),
            }
        };
        if self.inner.lock().connections.contains_key(key) {
            return Ok(Outcome::Done);
        }
        if !project::is_control_plane_ready(&found) {
            return Ok(Outcome::Done);
        }

        let uid = found
            .metadata
            .uid
            .clone()
            .ok_or_else(|| ProviderError::MissingUid(key.to_string()))?;
        let endpoint = self.settings.endpoint_for(&uid);
        let client = self
            .connect
            .connect(&endpoint)
            .await
            .map_err(|source| ProviderError::Connect {
                endpoint: endpoint.clone(),
                source,
            })?;

        let (policies, stop) = spawn_policy_store(client.clone());
        let synced = tokio::time::timeout(
            self.settings.cache_sync_timeout,
            policies.wait_until_ready(),
        )
        .await;
        if !matches!(synced, Ok(Ok(()))) {
            // Dropping `stop` cancels the reflector task before we bail.
            drop(stop);
            return Err(ProviderError::CacheSync);
        }

        let conn = ClusterConnection { client, policies };

        // Engage outside the lock; it is idempotent, so losing a race to a
        // concurrent pass is harmless.
        coordinator.engage(key, conn.clone());

        let mut state = self.inner.lock();
        if state.connections.contains_key(key) {
            return Ok(Outcome::Done);
        }
        state.connections.insert(
            key.to_string(),
            ConnectionEntry { conn, _stop: stop },
        );
        drop(state);
        info!(cluster = %key, %endpoint, "Connected tenant cluster");
        Ok(Outcome::Done)
    }

    fn remove(&self, key: &str) {
        let (coordinator, removed) = {
            let mut state = self.inner.lock();
            (
                state.coordinator.clone(),
                state.connections.remove(key).is_some(),
            )
        };
        if removed {
            if let Some(coordinator) = coordinator {
                coordinator.disengage(key);
            }
            info!(cluster = %key, "Removed tenant cluster");
        }
    }
}

fn requeue(tx: mpsc::Sender<String>, key: String, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(key).await;
    });
}

fn event_key(event: watcher::Event<DynamicObject>) -> Option<String> {
    match event {
        watcher::Event::Apply(obj)
        | watcher::Event::Delete(obj)
        | watcher::Event::InitApply(obj) => obj.metadata.name,
        watcher::Event::Init | watcher::Event::InitDone => None,
    }
}

/// Starts a cancellable reflector over a cluster's policies and returns
/// its read handle.
pub(crate) fn spawn_policy_store(
    client: Client,
) -> (reflector::Store<ExportPolicy>, oneshot::Sender<()>) {
    let api = Api::<ExportPolicy>::all(client);
    let (reader, writer) = reflector::store();
    let (stop_tx, stop_rx) = oneshot::channel();
    tokio::spawn(async move {
        let stream = watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .reflect(writer)
            .take_until(stop_rx);
        futures::pin_mut!(stream);
        while let Some(result) = stream.next().await {
            if let Err(error) = result {
                warn!(%error, "Policy watch failed");
            }
        }
    });
    (reader, stop_tx)
}
