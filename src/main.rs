use std::{net::SocketAddr, sync::Arc};

use agentmail_mcp::{
    build_app,
    cli::Cli,
    clock::{Clock, SystemClock},
    config::Config,
    lifecycle::{wait_for_signal, Shutdown},
    logging,
    mail_client::AgentMailClient,
    mcp::server::{McpServerFactory, ServerFactory},
    security::rate_limit::{RateLimitSettings, RateLimiter},
    session::{
        cleanup::CleanupScheduler,
        store::{SessionLimits, SessionStore},
    },
    transport::stdio::serve_stdio,
    AppState,
};
use clap::Parser;
use serde_json::json;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let cli = Cli::parse();
    let config = Config::from_env()?.with_port(cli.port);

    let provider = Arc::new(AgentMailClient::new(
        config.api_key.clone(),
        &config.mail_base_url,
    )?);
    let server_factory = Arc::new(McpServerFactory::new(provider));

    if cli.stdio {
        serve_stdio(server_factory.create_server()?).await?;
        return Ok(());
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let sessions = Arc::new(SessionStore::new(SessionLimits::default(), clock.clone()));
    let rate_limiter = Arc::new(RateLimiter::new(RateLimitSettings::default(), clock));

    let shutdown = Shutdown::new();
    let cleanup = CleanupScheduler::new(sessions.clone(), rate_limiter.clone())
        .spawn(shutdown.subscribe());

    let state = AppState::new(config.port, sessions.clone(), rate_limiter, server_factory);
    let app = build_app(state);

    let bind_socket = config.bind_socket();
    let listener = tokio::net::TcpListener::bind(bind_socket).await?;
    log_server_start(&config, bind_socket);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        wait_for_signal().await;
        shutdown.trigger();
    })
    .await?;

    let _ = cleanup.await;
    let closed = sessions.close_all();
    info!(closed, "sessions closed, server stopped");
    Ok(())
}

fn log_server_start(config: &Config, bind_socket: SocketAddr) {
    info!(bind = %bind_socket, production = config.is_production, "AgentMail MCP Server listening");

    if !config.is_production {
        let client_config = json!({
            "mcpServers": {
                "agentmail": { "url": format!("http://localhost:{}/mcp", config.port) }
            }
        });
        info!(
            client_config = %client_config,
            "add this server to your client config; the legacy /sse endpoint is also available"
        );
    }
}
