use std::sync::Arc;

use conductor::api::{AppState, api_routes};
use conductor::config::{OrchestratorConfig, TransportConfig};
use conductor::events::{EventHub, event_routes};
use conductor::exec::{AgentTransport, BulkOrchestrator, ExecutionCoordinator, HttpAgentTransport};
use conductor::scheduler;
use conductor::store::{MemoryStore, Store};
use conductor::tasks::graph::DependencyGraph;
use conductor::tasks::service::TaskService;
use conductor::tasks::{Authorizer, OwnerOrgAuthorizer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = OrchestratorConfig::from_env();

    let transport_config = TransportConfig::from_env().unwrap_or_else(|| {
        eprintln!("Error: CONDUCTOR_AGENT_URL not set");
        eprintln!("  export CONDUCTOR_AGENT_URL=http://localhost:9090");
        std::process::exit(1);
    });

    eprintln!("⚙️  Conductor v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Agent gateway: {}", transport_config.base_url);
    eprintln!("   Task API: http://{}/api/tasks", config.bind_addr);
    eprintln!("   Event WS: ws://{}/ws/events", config.bind_addr);
    eprintln!(
        "   Ticker: every {}s, bulk caps {}/{}\n",
        config.tick_interval.as_secs(),
        config.max_bulk_items,
        config.max_bulk_executions,
    );

    // ── Wiring ───────────────────────────────────────────────────────────
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let hub = Arc::new(EventHub::new());
    let authorizer: Arc<dyn Authorizer> = Arc::new(OwnerOrgAuthorizer);
    let transport: Arc<dyn AgentTransport> =
        Arc::new(HttpAgentTransport::new(transport_config));
    let graph = DependencyGraph::new(Arc::clone(&store), Arc::clone(&authorizer));

    let coordinator = ExecutionCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&transport),
        Arc::clone(&hub),
        graph.clone(),
        Arc::clone(&authorizer),
        &config,
    );
    let service = Arc::new(TaskService::new(
        Arc::clone(&store),
        graph,
        Arc::clone(&authorizer),
        Arc::clone(&hub),
        config.clone(),
    ));
    let bulk = Arc::new(BulkOrchestrator::new(
        Arc::clone(&store),
        Arc::clone(&coordinator),
        Arc::clone(&authorizer),
        config.clone(),
    ));

    // Spawn the due-task ticker
    let _ticker = scheduler::spawn_ticker(
        Arc::clone(&coordinator),
        Arc::clone(&store),
        config.tick_interval,
    );

    // ── Server ───────────────────────────────────────────────────────────
    let state = AppState {
        service,
        coordinator,
        bulk,
        hub: Arc::clone(&hub),
        store,
    };
    let app = api_routes(state).merge(event_routes(hub));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "Conductor server started");
    axum::serve(listener, app).await?;

    Ok(())
}
