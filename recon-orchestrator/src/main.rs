use std::sync::Arc;

use anyhow::Context;
use recon_core::domain::policy::Policy;
use recon_orchestrator::adapter::{AdapterRegistry, load_process_adapters};
use recon_orchestrator::api::{self, AppState};
use recon_orchestrator::config::Config;
use recon_orchestrator::policy::PolicyStore;
use recon_orchestrator::repository::InMemoryRepository;
use recon_orchestrator::service::{EngineSettings, JobSubmitter, Orchestrator, Scheduler};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "recon_orchestrator=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Recon Orchestrator...");

    let config = Config::from_env().context("Failed to read configuration")?;
    config.validate().context("Invalid configuration")?;

    let policies = match &config.policy_file {
        Some(path) => {
            tracing::info!("Loading policy from {}", path.display());
            PolicyStore::from_file(path).context("Failed to load policy")?
        }
        None => {
            tracing::warn!("No policy file configured, every tool is refused until one is loaded");
            PolicyStore::new(Policy::default()).context("Default policy is invalid")?
        }
    };
    tracing::info!("Policy version {} active", policies.current().version);

    let mut registry = AdapterRegistry::new();
    if let Some(path) = &config.adapters_file {
        for adapter in load_process_adapters(path)? {
            registry
                .register(Arc::new(adapter))
                .context("Failed to register adapter")?;
        }
    }
    tracing::info!("Registered adapters: {:?}", registry.names());

    let orchestrator = Arc::new(Orchestrator::start(
        EngineSettings::from(&config),
        Arc::new(policies),
        registry,
        Arc::new(InMemoryRepository::new()),
    ));

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&orchestrator) as Arc<dyn JobSubmitter>,
        config.scheduler_tick,
    ));

    let shutdown = CancellationToken::new();
    let scheduler_task = {
        let scheduler = Arc::clone(&scheduler);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };

    // Build router with all API endpoints
    let app = api::create_router(AppState {
        orchestrator: Arc::clone(&orchestrator),
        scheduler,
    });

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    shutdown.cancel();
    if let Err(e) = scheduler_task.await {
        tracing::error!("Scheduler task failed: {}", e);
    }
    orchestrator.shutdown().await;

    tracing::info!("Recon Orchestrator stopped");
    Ok(())
}
