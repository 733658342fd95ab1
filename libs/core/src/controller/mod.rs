pub mod context;

use self::context::Context;

use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::snapshot::Snapshot;
use crate::state::NodeState;

use std::fmt::Debug;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::Resource;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::controller::Action;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{self, Lookup, Store};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::error;

pub type ControllerId = &'static str;
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// State shared between the controllers and the web server
#[derive(Clone)]
pub struct State {
    /// Metrics
    metrics: Arc<Metrics>,
    /// Node-local shadow state behind the process-wide lock
    pub node: Arc<Mutex<NodeState>>,
    /// Cache for Pod resources
    pub pod_store: Store<Pod>,
    /// Cache for Namespace resources
    pub namespace_store: Store<Namespace>,
    /// Cache for NetworkPolicy resources
    pub policy_store: Store<NetworkPolicy>,
}

/// Store/writer pair backing one controller's watcher stream
pub struct ResourceReflector<K>
where
    K: Resource + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Eq + std::hash::Hash + Clone,
{
    pub store: Store<K>,
    pub writer: Writer<K>,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new(
        metrics: Metrics,
        node: Arc<Mutex<NodeState>>,
        pod_store: Store<Pod>,
        namespace_store: Store<Namespace>,
        policy_store: Store<NetworkPolicy>,
    ) -> Self {
        Self {
            metrics: Arc::new(metrics),
            node,
            pod_store,
            namespace_store,
            policy_store,
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Result<String> {
        let mut buffer = String::new();
        let registry = &*self.metrics.registry;
        prometheus_client::encoding::text::encode(&mut buffer, registry)
            .map_err(|e| Error::FormattingError("failed to encode metrics".to_string(), e))?;
        Ok(buffer)
    }

    /// Encoded shadow-state snapshot for the debug endpoint
    pub async fn snapshot(&self) -> Snapshot {
        self.node.lock().await.snapshot()
    }

    /// Create a Controller Context that can update State
    pub fn to_context<K>(&self, client: Client, controller_id: ControllerId) -> Context<K>
    where
        K: Resource + Lookup + Clone + 'static,
        <K as Lookup>::DynamicType: Default + Eq + std::hash::Hash + Clone,
    {
        Context::new(
            controller_id,
            client,
            self.metrics
                .controllers
                .get(controller_id)
                .expect("all CONTROLLER_IDs have to be registered")
                .clone(),
            self.metrics.cluster.clone(),
            self.node.clone(),
            self.pod_store.clone(),
            self.namespace_store.clone(),
            self.policy_store.clone(),
        )
    }
}

pub async fn check_api_queryable<K>(client: Client) -> Api<K>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let api = Api::<K>::all(client.clone());
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!(
            "{} is not queryable; {e:?}. Check agent permissions",
            short_type_name::<K>().unwrap_or("Unknown resource"),
        );
        std::process::exit(1);
    }
    api
}

pub fn create_reflector<K>() -> ResourceReflector<K>
where
    K: Resource + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let (store, writer) = reflector::store();
    ResourceReflector { store, writer }
}

pub fn error_policy<K>(_obj: Arc<K>, _error: &Error, _ctx: Arc<Context<K>>) -> Action
where
    K: Resource + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    unreachable!("Handle in backoff_reconciler macro")
}

#[inline]
pub fn short_type_name<K>() -> Option<&'static str> {
    let type_name = std::any::type_name::<K>();
    type_name.split("::").last()
}

#[macro_export]
macro_rules! backoff_reconciler {
    ($inner_reconciler:ident) => {
        |obj, ctx| async move {
            use $crate::controller::context::BackoffContext;
            match $inner_reconciler(obj.clone(), ctx.clone()).await {
                Ok(action) => {
                    ctx.reset_backoff(kube::runtime::reflector::ObjectRef::from(obj.as_ref()))
                        .await;
                    Ok(action)
                }
                Err(error) => {
                    let namespace =
                        kube::ResourceExt::namespace(obj.as_ref()).unwrap_or_default();
                    let name = kube::ResourceExt::name_any(obj.as_ref());
                    tracing::error!(msg = "failed reconciliation", %namespace, %name, %error);
                    ctx.metrics().reconcile_failure_inc();
                    let backoff_duration = ctx
                        .get_backoff(kube::runtime::reflector::ObjectRef::from(obj.as_ref()))
                        .await;
                    tracing::trace!(
                        msg = format!("backoff duration: {backoff_duration:?}"),
                        %namespace,
                        %name,
                    );
                    Ok(kube::runtime::controller::Action::requeue(backoff_duration))
                }
            }
        }
    };
}
