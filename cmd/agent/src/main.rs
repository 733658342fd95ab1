use polman_core::controller::{State as AgentState, check_api_queryable, create_reflector};
use polman_core::metrics::Metrics;
use polman_core::state::NodeState;
use polman_core::telemetry;
use polman_dataplane::exec::SystemRunner;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{Router, get};
use clap::{Parser, Subcommand, crate_description, crate_version};
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::Config;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Mutex;

async fn metrics_handler(State(state): State<AgentState>) -> impl IntoResponse {
    match state.metrics() {
        Ok(metrics) => (
            StatusCode::OK,
            [(
                "content-type",
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            metrics,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to get metrics: {:?}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn health() -> impl IntoResponse {
    Json("healthy")
}

async fn manager_snapshot(State(state): State<AgentState>) -> impl IntoResponse {
    match state.snapshot().await.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "application/json")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to encode snapshot: {:?}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "polman",
    about = crate_description!(),
    version = crate_version!(),
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the node agent
    Start(StartArgs),
    /// Print the agent version
    Version,
}

#[derive(clap::Args, Debug)]
struct StartArgs {
    /// Listen on given port
    #[arg(short, long, default_value_t = 10091, env)]
    port: u16,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=debug,polman=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// Name of the node this agent runs on, usually injected via the
    /// downward API
    #[arg(long, env = "NODE_NAME", default_value = "localhost")]
    node_name: String,

    /// Save the pre-existing ipset state to this file before the startup
    /// sweep
    #[arg(long, env)]
    ipset_backup_file: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::Start(args) => start(args).await,
        Command::Version => {
            println!("polman {}", crate_version!());
            Ok(())
        }
    }
}

async fn start(args: StartArgs) -> anyhow::Result<()> {
    telemetry::init(&args.log_filter, args.log_format)?;

    let config = Config::infer().await?;
    let client = kube::Client::try_from(config)?;

    let controllers = [
        polman_pod::controller::CONTROLLER_ID,
        polman_namespace::controller::CONTROLLER_ID,
        polman_policy::controller::CONTROLLER_ID,
    ];
    let metrics = Metrics::new(Registry::default(), &controllers);

    let mut node = NodeState::new(
        args.node_name,
        Arc::new(SystemRunner),
        metrics.dataplane.clone(),
    );
    if let Some(path) = &args.ipset_backup_file {
        if let Err(e) = node.sets.save(path) {
            tracing::warn!(msg = "failed to back up ipset state", %e);
        }
    }
    node.bootstrap()?;
    let node = Arc::new(Mutex::new(node));

    let pod_api = check_api_queryable::<Pod>(client.clone()).await;
    let pod_r = create_reflector::<Pod>();
    let namespace_api = check_api_queryable::<Namespace>(client.clone()).await;
    let namespace_r = create_reflector::<Namespace>();
    let policy_api = check_api_queryable::<NetworkPolicy>(client.clone()).await;
    let policy_r = create_reflector::<NetworkPolicy>();

    let state = AgentState::new(
        metrics,
        node,
        pod_r.store.clone(),
        namespace_r.store.clone(),
        policy_r.store.clone(),
    );

    let pod_c = polman_pod::controller::run(state.clone(), client.clone(), pod_api, pod_r);
    let namespace_c = polman_namespace::controller::run(
        state.clone(),
        client.clone(),
        namespace_api,
        namespace_r,
    );
    let policy_c = polman_policy::controller::run(state.clone(), client, policy_api, policy_r);

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health))
        .route("/debug/manager", get(manager_snapshot))
        .with_state(state.clone());

    let listener = TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    tokio::join!(pod_c, namespace_c, policy_c, server).3?;
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM signal handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
}
