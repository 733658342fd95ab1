use crate::reconcile::reconcile_namespace;

use polman_core::backoff_reconciler;
use polman_core::controller::{ControllerId, ResourceReflector, State, error_policy};

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::Api;
use kube::client::Client;
use kube::runtime::controller::{self, Controller};
use kube::runtime::{WatchStreamExt, watcher};
use tokio::time::Duration;
use tracing::info;

pub const CONTROLLER_ID: ControllerId = "namespace";

/// Initialize the namespace controller
pub async fn run(
    state: State,
    client: Client,
    api: Api<Namespace>,
    reflector: ResourceReflector<Namespace>,
) {
    let ctx = Arc::new(state.to_context::<Namespace>(client, CONTROLLER_ID));

    info!(msg = format!("starting {CONTROLLER_ID} controller"));
    let namespace_stream = watcher(api, watcher::Config::default().any_semantic())
        .default_backoff()
        .reflect(reflector.writer)
        .touched_objects();

    let namespace_controller = Controller::for_stream(namespace_stream, reflector.store)
        // debounce to filter out reconcile calls that happen in quick succession (only taking the latest)
        .with_config(
            controller::Config::default()
                .debounce(Duration::from_millis(500))
                .concurrency(1),
        )
        .shutdown_on_signal()
        .run(
            backoff_reconciler!(reconcile_namespace),
            error_policy,
            ctx.clone(),
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    ctx.metrics.ready_set(1);
    namespace_controller.await;
}
