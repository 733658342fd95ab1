use super::{ControllerId, DEFAULT_RESYNC_INTERVAL};

use crate::metrics::{ClusterMetrics, ControllerMetrics};
use crate::state::NodeState;

use std::collections::HashMap;
use std::sync::Arc;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::Resource;
use kube::client::Client;
use kube::runtime::reflector::{Lookup, ObjectRef, Store};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Duration;
use tracing::trace;

/// Context handed to every reconciler.
///
/// All three controllers share the same node state and stores; the context is
/// parameterized only so backoff bookkeeping is keyed by the right resource.
#[derive(Clone)]
pub struct Context<K: Resource> {
    /// Controller ID
    pub controller_id: ControllerId,
    /// Kubernetes client
    pub client: Client,
    /// Prometheus metrics of this controller
    pub metrics: Arc<ControllerMetrics>,
    /// Cluster-wide metrics shared by all controllers
    pub cluster_metrics: Arc<ClusterMetrics>,
    /// The node-local shadow state, guarded by the process-wide lock
    pub node: Arc<Mutex<NodeState>>,
    /// Cache for Pod resources
    pub pod_store: Store<Pod>,
    /// Cache for Namespace resources
    pub namespace_store: Store<Namespace>,
    /// Cache for NetworkPolicy resources
    pub policy_store: Store<NetworkPolicy>,
    /// State of the error backoff policy per object
    error_backoff_cache: Arc<RwLock<HashMap<ObjectRef<K>, RwLock<ExponentialBackoff>>>>,
}

impl<K> Context<K>
where
    K: Resource + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Eq + std::hash::Hash + Clone,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        controller_id: ControllerId,
        client: Client,
        metrics: Arc<ControllerMetrics>,
        cluster_metrics: Arc<ClusterMetrics>,
        node: Arc<Mutex<NodeState>>,
        pod_store: Store<Pod>,
        namespace_store: Store<Namespace>,
        policy_store: Store<NetworkPolicy>,
    ) -> Self {
        Self {
            controller_id,
            client,
            metrics,
            cluster_metrics,
            node,
            pod_store,
            namespace_store,
            policy_store,
            error_backoff_cache: Arc::default(),
        }
    }
}

#[allow(async_fn_in_trait)]
pub trait BackoffContext<K: Resource> {
    fn metrics(&self) -> &Arc<ControllerMetrics>;
    async fn get_backoff(&self, obj_ref: ObjectRef<K>) -> Duration;
    async fn reset_backoff(&self, obj_ref: ObjectRef<K>);
}

impl<K> BackoffContext<K> for Context<K>
where
    K: Resource<DynamicType = ()> + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Eq + std::hash::Hash + Clone,
{
    fn metrics(&self) -> &Arc<ControllerMetrics> {
        &self.metrics
    }

    /// Return next duration of the backoff policy for the given object
    async fn get_backoff(&self, obj_ref: ObjectRef<K>) -> Duration {
        {
            let read_guard = self.error_backoff_cache.read().await;
            if let Some(backoff) = read_guard.get(&obj_ref) {
                if let Some(duration) = backoff.write().await.next() {
                    return duration;
                }
            }
        }

        // Backoff policy: 1s, 2s, 4s, 8s, 16s, 32s, 64s, 128s, 256s, 300s, 300s...
        let mut backoff = ExponentialBuilder::default()
            .with_max_delay(DEFAULT_RESYNC_INTERVAL)
            .without_max_times()
            .build();
        // safe unwrap: first backoff is always Some(Duration)
        let duration = backoff.next().unwrap();
        self.error_backoff_cache
            .write()
            .await
            .insert(obj_ref.clone(), RwLock::new(backoff));
        trace!(
            msg = "recreate backoff policy",
            namespace = obj_ref.namespace.as_deref().unwrap_or_default(),
            name = obj_ref.name,
        );
        duration
    }

    /// Reset the backoff policy for the given object
    async fn reset_backoff(&self, obj_ref: ObjectRef<K>) {
        let read_guard = self.error_backoff_cache.read().await;
        if read_guard.get(&obj_ref).is_some() {
            drop(read_guard);
            trace!(
                msg = "reset backoff policy",
                namespace = obj_ref.namespace.as_deref().unwrap_or_default(),
                name = obj_ref.name
            );
            self.error_backoff_cache.write().await.remove(&obj_ref);
        }
    }
}
