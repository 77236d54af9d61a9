//! # Call Agent Bridge - Main Application Entry Point
//!
//! Bridges live phone calls to a conversational speech agent. The telephony
//! provider streams call audio to `/media`; every stream gets its own supervisor
//! that relays caller audio to the speech agent and agent audio back to the caller.
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML files + environment variables)
//! - **state**: Shared application state and relay counters
//! - **audio**: Frame buffer, noise gate and call session state
//! - **relay**: Inbound/outbound relays, wire protocol and function dispatch
//! - **speech_client**: Outbound WebSocket connection to the speech agent
//! - **websocket**: Per-call supervisor actor
//! - **handlers**: Call instructions, outbound calls and configuration endpoints
//! - **health**: Health and metrics endpoints
//! - **error**: Custom error types and HTTP error responses

mod audio;         // Frame buffer, noise gate, session state (audio/ directory)
mod config;        // Configuration management (config.rs)
mod error;         // Error handling types (error.rs)
mod handlers;      // HTTP request handlers (handlers/ directory)
mod health;        // Health check endpoints (health.rs)
mod relay;         // Audio and control relays (relay/ directory)
mod speech_client; // Speech agent WebSocket client (speech_client.rs)
mod state;         // Application state management (state.rs)
mod websocket;     // Media stream supervisor (websocket.rs)

use crate::config::AppConfig;
use crate::relay::functions::FunctionRegistry;
use crate::state::AppState;
use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGTERM or SIGINT arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Builds the function table** and the agent settings sent on every call
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Handles graceful shutdown** when receiving system signals
#[actix_web::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting call-agent-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    if config.speech.api_key.is_empty() {
        warn!("No speech agent API key configured; the agent will likely refuse connections");
    }

    let functions = build_function_registry();
    let agent_settings = config.load_agent_settings(&functions)?;
    info!(
        "Registered {} agent functions: {:?}",
        functions.len(),
        functions.names()
    );

    let app_state = AppState::new(config.clone(), functions, agent_settings);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/calls", web::post().to(handlers::outbound_call)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/twiml", web::get().to(handlers::twiml))
            .route("/twiml", web::post().to(handlers::twiml))
            .route("/media", web::get().to(websocket::media_stream))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g. "debug", "call_agent_bridge=trace")
/// - If not set, defaults to "call_agent_bridge=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "call_agent_bridge=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Functions the agent may call during a conversation.
fn build_function_registry() -> FunctionRegistry {
    FunctionRegistry::builder()
        .register(
            "get_current_time",
            "Get the current date and time in UTC",
            json!({"type": "object", "properties": {}}),
            |_args| {
                let now = chrono::Utc::now();
                Ok(json!({
                    "iso": now.to_rfc3339(),
                    "spoken": now.format("%A, %B %-d, %H:%M UTC").to_string(),
                }))
            },
        )
        .build()
}

/// Listen for SIGTERM and SIGINT and raise the shutdown flag.
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Poll the shutdown flag every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::functions::Invocation;

    #[test]
    fn test_builtin_functions() {
        let functions = build_function_registry();
        assert!(functions.contains("get_current_time"));

        match functions.invoke("get_current_time", json!({})) {
            Invocation::Completed(value) => assert!(value["iso"].is_string()),
            other => panic!("unexpected invocation result: {:?}", other),
        }
    }
}
