use crate::{
    admission::Admission,
    artifacts::DownstreamSecrets,
    compiler::MetricsService,
    multicluster::{ClusterConnection, Coordinator},
    provider::{spawn_policy_store, ClusterProvider, KubeConnect, ProviderSettings},
};
use anyhow::{bail, Result};
use clap::Parser;
use kube::api::Api;
use prometheus_client::registry::Registry;
use std::{sync::Arc, time::Duration};
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "telemetry-export-controller",
    about = "Compiles telemetry export policies into pipeline configuration for the data-movement agent"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "telemetry_export_controller=info,warn",
        env = "EXPORT_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission controller server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// Read endpoint metric sources are scraped from.
    #[clap(long, env = "METRICS_QUERY_ENDPOINT")]
    metrics_query_endpoint: String,

    #[clap(long, env = "METRICS_QUERY_USERNAME")]
    metrics_query_username: Option<String>,

    #[clap(long, env = "METRICS_QUERY_PASSWORD", hide_env_values = true)]
    metrics_query_password: Option<String>,

    /// Namespace pipeline config artifacts are written to.
    #[clap(long, default_value = "telemetry-system")]
    downstream_namespace: String,

    /// Kubeconfig for the cluster artifacts are written to; the local
    /// cluster is used when unset.
    #[clap(long)]
    downstream_kubeconfig: Option<std::path::PathBuf>,

    /// Label marking artifacts for discovery by the data-movement agent.
    #[clap(long, default_value = "telemetry.tenantops.dev/pipeline-config")]
    discovery_label_key: String,

    #[clap(long, default_value = "true")]
    discovery_label_value: String,

    #[clap(long, value_enum, default_value_t = DiscoveryMode::Project)]
    discovery_mode: DiscoveryMode,

    /// Tenant identity used in single-cluster mode.
    #[clap(long, default_value = "default")]
    tenant: String,

    /// Endpoint template for tenant control planes; `{uid}` is replaced
    /// with the project UID.
    #[clap(
        long,
        default_value = "https://tenant-apiserver.project-{uid}.svc.cluster.local:6443"
    )]
    project_url_template: String,

    #[clap(long, default_value = "60")]
    cache_sync_timeout_secs: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
enum DiscoveryMode {
    /// Reconcile policies on the local cluster only.
    Single,
    /// Discover tenant project control planes and reconcile each one.
    Project,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            server,
            admin,
            admission_controller_disabled,
            metrics_query_endpoint,
            metrics_query_username,
            metrics_query_password,
            downstream_namespace,
            downstream_kubeconfig,
            discovery_label_key,
            discovery_label_value,
            discovery_mode,
            tenant,
            project_url_template,
            cache_sync_timeout_secs,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let mut prom = <Registry>::default();
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        let local = runtime.client();
        let cache_sync_timeout = Duration::from_secs(cache_sync_timeout_secs);

        let downstream = match &downstream_kubeconfig {
            Some(path) => {
                let kubeconfig = kube::config::Kubeconfig::read_from(path)?;
                let config =
                    kube::Config::from_custom_kubeconfig(kubeconfig, &Default::default()).await?;
                kube::Client::try_from(config)?
            }
            None => local.clone(),
        };
        let artifacts = Arc::new(DownstreamSecrets::new(
            Api::namespaced(downstream, &downstream_namespace),
            (discovery_label_key, discovery_label_value),
        ));

        let metrics = MetricsService {
            endpoint: metrics_query_endpoint,
            username: metrics_query_username,
            password: metrics_query_password,
        };
        let coordinator = Coordinator::new(metrics, artifacts);

        // Kept alive for the process lifetime in single-cluster mode;
        // dropping it would cancel the local policy reflector.
        let mut _local_store_stop = None;
        match discovery_mode {
            DiscoveryMode::Single => {
                let (policies, stop) = spawn_policy_store(local.clone());
                match tokio::time::timeout(cache_sync_timeout, policies.wait_until_ready()).await
                {
                    Ok(Ok(())) => {}
                    _ => bail!("timed out waiting for the local policy cache to sync"),
                }
                coordinator.engage(
                    &tenant,
                    ClusterConnection {
                        client: local.clone(),
                        policies,
                    },
                );
                _local_store_stop = Some(stop);
                info!(%tenant, "Running in single-cluster mode");
            }
            DiscoveryMode::Project => {
                let base = kube::Config::infer().await?;
                let provider = ClusterProvider::new(
                    Arc::new(KubeConnect::new(base)),
                    ProviderSettings {
                        url_template: project_url_template,
                        cache_sync_timeout,
                    },
                );
                tokio::spawn(
                    provider
                        .run(coordinator.clone(), local.clone(), runtime.shutdown_handle())
                        .instrument(info_span!("discovery")),
                );
                info!("Running in project-discovery mode");
            }
        }

        let runtime = runtime.spawn_server(Admission::new);

        // Block on the shutdown signal, then wait for background tasks to
        // wind down before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
