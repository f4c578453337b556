//! `HealthPolicy` controller: watches, mappers and the reconcile entry points.

use std::sync::Arc;

use futures::StreamExt;
use kube::api::{DynamicObject, ListParams};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Api, Client, Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, Instrument};

pub mod driver;
pub mod reports;
pub mod schedule;
pub mod sink;
pub mod store;

pub use driver::Engine;
pub use reports::KubeReports;
pub use schedule::EvaluationSchedule;
pub use sink::{health_event, NotificationRouter, NotificationSink};
pub use store::{update_status_with_retry, ClusterPresence, KubeStore, PolicyStore};

use crate::capability::{
    detect_capability, run_capability_watcher, Capability, CapabilityWatcher, KubeCrdLookup,
    SignalProcessControl,
};
use crate::config::ControllerConfig;
use crate::crds::{
    AddonSummary, ClusterType, HealthDefinition, HealthPolicy, HealthReport, ManagedCluster,
};
use crate::engine::{Labels, ObjectKey, ObjectSet};
use crate::error::{Error, Result};

/// Finalizer keeping a deleted policy around until the index has released it
pub const FINALIZER_NAME: &str = "health.platform/healthpolicy-finalizer";

/// Shared reconcile context
pub struct Context {
    pub client: Client,
    pub engine: Arc<Engine>,
}

fn policy_refs(policies: &ObjectSet) -> Vec<ObjectRef<HealthPolicy>> {
    policies
        .iter()
        .map(|policy| ObjectRef::new(&policy.name))
        .collect()
}

/// Apply a cluster watch event to the index
fn cluster_event<K: Resource>(engine: &Engine, cluster: &K, cluster_type: ClusterType) -> ObjectSet {
    let Some(namespace) = cluster.meta().namespace.as_deref() else {
        return ObjectSet::new();
    };
    let Some(name) = cluster.meta().name.as_deref() else {
        return ObjectSet::new();
    };
    let key = ObjectKey::cluster(namespace, name, cluster_type);

    if cluster.meta().deletion_timestamp.is_some() {
        debug!(cluster = %key, "Cluster being deleted");
        engine.cluster_deleted(&key)
    } else {
        let labels: Labels = cluster.meta().labels.clone().unwrap_or_default();
        engine.cluster_changed(&key, labels)
    }
}

fn managed_cluster_mapper(
    engine: Arc<Engine>,
) -> impl Fn(ManagedCluster) -> Vec<ObjectRef<HealthPolicy>> + Send + Sync + 'static {
    move |cluster| policy_refs(&cluster_event(&engine, &cluster, ClusterType::Managed))
}

fn capi_cluster_mapper(
    engine: Arc<Engine>,
) -> impl Fn(DynamicObject) -> Vec<ObjectRef<HealthPolicy>> + Send + Sync + 'static {
    move |cluster| policy_refs(&cluster_event(&engine, &cluster, ClusterType::Capi))
}

fn health_definition_mapper(
    engine: Arc<Engine>,
) -> impl Fn(HealthDefinition) -> Vec<ObjectRef<HealthPolicy>> + Send + Sync + 'static {
    move |definition| {
        let key = ObjectKey::health_definition(&definition.name_any());
        policy_refs(&engine.definition_changed(&key))
    }
}

fn health_report_mapper(
    engine: Arc<Engine>,
) -> impl Fn(HealthReport) -> Vec<ObjectRef<HealthPolicy>> + Send + Sync + 'static {
    move |report| {
        let spec = &report.spec;
        let cluster = ObjectKey::cluster(&spec.cluster_namespace, &spec.cluster_name, spec.cluster_type);
        let definition = ObjectKey::health_definition(&spec.health_definition_name);
        policy_refs(&engine.report_changed(&definition, &cluster))
    }
}

fn addon_summary_mapper(
    engine: Arc<Engine>,
) -> impl Fn(AddonSummary) -> Vec<ObjectRef<HealthPolicy>> + Send + Sync + 'static {
    move |summary| {
        let spec = &summary.spec;
        let cluster = ObjectKey::cluster(&spec.cluster_namespace, &spec.cluster_name, spec.cluster_type);
        policy_refs(&engine.addons_changed(&cluster))
    }
}

/// Seed the index with every existing cluster before the first reconcile
async fn rebuild_index(client: &Client, engine: &Engine, capability: Capability) -> Result<()> {
    let managed: Api<ManagedCluster> = Api::all(client.clone());
    let clusters = managed.list(&ListParams::default()).await?;
    let mut seeded = clusters.items.len();
    for cluster in &clusters.items {
        cluster_event(engine, cluster, ClusterType::Managed);
    }

    if capability == Capability::Present {
        let capi: Api<DynamicObject> = Api::all_with(client.clone(), &store::capi_cluster_resource());
        let clusters = capi.list(&ListParams::default()).await?;
        seeded += clusters.items.len();
        for cluster in &clusters.items {
            cluster_event(engine, cluster, ClusterType::Capi);
        }
    }

    info!(clusters = seeded, "Seeded cluster index");
    Ok(())
}

/// Reconcile entry point for `HealthPolicy`
#[instrument(skip_all, fields(policy = %policy.name_any()))]
pub async fn reconcile_health_policy(policy: Arc<HealthPolicy>, ctx: Arc<Context>) -> Result<Action> {
    let policies: Api<HealthPolicy> = Api::all(ctx.client.clone());

    finalizer(&policies, FINALIZER_NAME, policy, |event| async {
        match event {
            FinalizerEvent::Apply(policy) => ctx.engine.reconcile_policy(&policy).await,
            FinalizerEvent::Cleanup(policy) => ctx.engine.cleanup_policy(&policy),
        }
    })
    .await
    .map_err(|e| match e {
        kube::runtime::finalizer::Error::ApplyFailed(err)
        | kube::runtime::finalizer::Error::CleanupFailed(err) => err,
        kube::runtime::finalizer::Error::AddFinalizer(e)
        | kube::runtime::finalizer::Error::RemoveFinalizer(e) => Error::KubeError(e),
        kube::runtime::finalizer::Error::UnnamedObject => Error::MissingObjectKey,
        kube::runtime::finalizer::Error::InvalidFinalizer => {
            Error::Finalizer("Invalid finalizer name".to_string())
        }
    })
}

#[instrument(skip_all, fields(policy = %policy.name_any()))]
fn error_policy(policy: Arc<HealthPolicy>, err: &Error, ctx: Arc<Context>) -> Action {
    error!(error = ?err, policy = %policy.name_any(), "HealthPolicy reconciliation failed");
    Action::requeue(ctx.engine.config().error_requeue())
}

/// Run the health controller until `shutdown` is cancelled
#[instrument(skip_all)]
pub async fn run_health_controller(
    client: Client,
    config: ControllerConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(shard = %config.shard_key, workers = config.workers, "Starting HealthPolicy controller");

    let detection = detect_capability(
        &KubeCrdLookup::new(client.clone()),
        config.capability.max_attempts,
        config.capability_backoff(),
    )
    .await;

    let reports = Arc::new(KubeReports::new(client.clone()));
    let engine = Arc::new(Engine::new(
        config.clone(),
        Arc::new(KubeStore::new(client.clone())),
        reports.clone(),
        reports,
        Arc::new(NotificationRouter::new(client.clone())),
        shutdown.child_token(),
    ));

    rebuild_index(&client, &engine, detection.capability).await?;

    tokio::spawn(run_capability_watcher(
        client.clone(),
        CapabilityWatcher::new(detection),
        Arc::new(SignalProcessControl),
        shutdown.clone(),
    ));

    let context = Arc::new(Context {
        client: client.clone(),
        engine: engine.clone(),
    });

    let watcher_config = watcher::Config::default().any_semantic();
    let mut health_controller = Controller::new(
        Api::<HealthPolicy>::all(client.clone()),
        watcher_config.clone(),
    )
    .with_config(controller::Config::default().concurrency(config.concurrent_reconciles))
    .watches(
        Api::<ManagedCluster>::all(client.clone()),
        watcher_config.clone(),
        managed_cluster_mapper(engine.clone()),
    )
    .watches(
        Api::<HealthDefinition>::all(client.clone()),
        watcher_config.clone(),
        health_definition_mapper(engine.clone()),
    )
    .watches(
        Api::<HealthReport>::all(client.clone()),
        watcher_config.clone(),
        health_report_mapper(engine.clone()),
    )
    .watches(
        Api::<AddonSummary>::all(client.clone()),
        watcher_config.clone(),
        addon_summary_mapper(engine.clone()),
    );

    if detection.capability == Capability::Present {
        let resource = store::capi_cluster_resource();
        health_controller = health_controller.watches_with(
            Api::<DynamicObject>::all_with(client.clone(), &resource),
            resource,
            watcher_config,
            capi_cluster_mapper(engine.clone()),
        );
    }

    let stop = shutdown.clone();
    health_controller
        .graceful_shutdown_on(async move { stop.cancelled().await })
        .run(reconcile_health_policy, error_policy, context)
        .for_each(|reconciliation_result| {
            let span = tracing::info_span!("health_policy_reconciliation_result");
            async move {
                match reconciliation_result {
                    Ok((policy, _)) => {
                        debug!(policy = %policy.name, "HealthPolicy reconciliation successful");
                    }
                    Err(reconciliation_err) => {
                        error!(error = ?reconciliation_err, "HealthPolicy reconciliation error");
                    }
                }
            }
            .instrument(span)
        })
        .await;

    engine.shutdown();
    info!("HealthPolicy controller shutting down");
    Ok(())
}
