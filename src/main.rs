use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use session_relay::config::ServerConfig;
use session_relay::game::engine::Environment;
use session_relay::game::kinds::GameContext;
use session_relay::game::policy::PolicyRegistry;
use session_relay::game::sandbox::GridWorld;
use session_relay::game::trajectory::{JsonDirSink, TrajectorySink};
use session_relay::lobby::manager::LobbyManager;
use session_relay::metrics::{self, Metrics};
use session_relay::net::hub::RoomHub;
use session_relay::net::transport::TcpServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Session Relay v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::load_or_default();
    config.validate().map_err(anyhow::Error::msg)?;
    info!(
        "Configuration loaded: {}:{}, max_sessions={}, target_fps={}",
        config.bind_address, config.port, config.max_sessions, config.target_fps
    );

    let policies = PolicyRegistry::from_specs(&config.npc_policies);
    info!("NPC kinds: {:?}", policies.names());

    let layouts = config.layouts.clone();
    let sink: Arc<dyn TrajectorySink> = Arc::new(JsonDirSink::new(config.data_dir.clone()));
    let games = GameContext {
        environment: Arc::new(move || Box::new(GridWorld::new(layouts.clone())) as Box<dyn Environment>),
        max_game_time: config.max_game_time(),
        default_layouts: config.layouts.iter().take(1).cloned().collect(),
        sink: Some(sink),
    };

    let metrics = Arc::new(Metrics::new());
    let hub = Arc::new(RoomHub::new(metrics.clone()));
    let manager = LobbyManager::new(
        config.lobby(),
        policies,
        games,
        hub.clone(),
        metrics.clone(),
    );

    let debug_address = config.bind_address.to_string();
    let debug_port = config.debug_port;
    let metrics_clone = metrics.clone();
    let manager_clone = manager.clone();
    tokio::spawn(async move {
        if let Err(e) =
            metrics::start_metrics_server(metrics_clone, manager_clone, &debug_address, debug_port)
                .await
        {
            error!("Metrics server error: {}", e);
        }
    });

    let server = TcpServer::bind(&config, manager.clone(), hub, metrics).await?;
    info!("Server ready on {}", server.local_addr()?);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = shutdown => {
            info!("Shutting down...");
        }
    }

    // Tick loops are OS threads; joining them blocks
    tokio::task::spawn_blocking(move || manager.shutdown()).await?;
    info!("Server stopped");

    Ok(())
}
