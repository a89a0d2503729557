// Conductor API server
// Decision: the in-memory profile (CONDUCTOR_IN_MEMORY=1) needs no broker or
// database; production runs Redis + Postgres

mod bootstrap;
mod common;
mod health;
mod parked;
mod workflows;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use conductor_core::{LogFormat, OrchestratorConfig};

use bootstrap::Orchestrator;

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        workflows::create_workflow,
        workflows::get_workflow,
        workflows::list_workflows,
        workflows::cancel_workflow,
        workflows::resolve_decision,
        parked::list_parked,
        health::liveness,
        health::readiness,
        health::detailed,
    ),
    components(
        schemas(
            conductor_contracts::Workflow,
            conductor_contracts::WorkflowStatus,
            conductor_contracts::WorkflowType,
            conductor_contracts::Stage,
            conductor_contracts::PendingDecision,
            workflows::CreateWorkflowBody,
            workflows::CancelWorkflowBody,
            workflows::ResolveDecisionBody,
            common::ErrorResponse,
        )
    ),
    tags(
        (name = "workflows", description = "Workflow lifecycle endpoints"),
        (name = "parked", description = "Dead-lettered results"),
        (name = "health", description = "Liveness and readiness probes")
    ),
    info(
        title = "Conductor API",
        version = "0.3.0",
        description = "Agentic software-delivery orchestrator",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
struct ApiDoc;

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "conductor_api=info,conductor_core=info,tower_http=info".into());

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let config = OrchestratorConfig::from_env().context("invalid configuration")?;
    init_tracing(config.log_format);

    tracing::info!("conductor-api starting...");

    let bind_addr = config.bind_addr.clone();
    let orchestrator = Orchestrator::start(config)
        .await
        .context("failed to start orchestrator")?;

    let workflows_state = workflows::AppState {
        service: orchestrator.workflow_service.clone(),
    };
    let parked_state = parked::AppState {
        service: orchestrator.workflow_service.clone(),
    };
    let health_state = health::AppState {
        store: orchestrator.store.clone(),
        kv: orchestrator.kv.clone(),
        bus: orchestrator.bus.clone(),
        worker_id: orchestrator.config.worker_id.clone(),
    };

    let app = Router::new()
        .merge(workflows::routes(workflows_state))
        .merge(parked::routes(parked_state))
        .merge(health::routes(health_state))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!("listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    orchestrator.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
