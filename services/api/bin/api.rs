//! Main Entrypoint for the Parley API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing the model clients and answer backends.
//! 3. Starting the tool-server connection manager.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use parley_api::{config::Config, router::create_router, state::AppState};
use parley_core::{
    intent::IntentClassifier,
    llm_client::{LLMClient, OpenAICompatibleClient, OutputModality},
    retrieval::{EmptyRetriever, Retriever, SupabaseRetriever},
    router::{IntentRouter, RouterSettings},
    tools::{ChildProcessLauncher, FINANCIAL_SERVER, ToolServerManager, WEATHER_SERVER},
    weather::{OpenWeatherClient, ToolServerWeather, WeatherBackend},
};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = ?e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

/// Connects the well-known tool servers in the background so the first
/// question does not pay for the launch.
fn preconnect(tools: &Arc<ToolServerManager>) {
    for server in [WEATHER_SERVER, FINANCIAL_SERVER] {
        if !tools.server_names().iter().any(|name| name == server) {
            continue;
        }
        let tools = tools.clone();
        tokio::task::spawn_blocking(move || match tools.connect(server) {
            Ok(()) => info!(server, "Tool server pre-connected"),
            Err(e) => warn!(server, error = %e, "Tool server pre-connect failed; will retry on first use"),
        });
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Model Clients ---
    let llm_config = OpenAIConfig::new()
        .with_api_key(&config.llm_api_key)
        .with_api_base(&config.llm_base_url);
    let answer_llm: Arc<dyn LLMClient> = Arc::new(
        OpenAICompatibleClient::new(llm_config.clone(), config.chat_model.clone())
            .with_voice(&config.voice),
    );
    let intent_llm: Arc<dyn LLMClient> = Arc::new(
        OpenAICompatibleClient::new(llm_config.clone(), config.intent_model.clone())
            .with_extra_body(json!({ "enable_thinking": false })),
    );
    let vision_llm: Arc<dyn LLMClient> = Arc::new(OpenAICompatibleClient::new(
        llm_config.clone(),
        config.vision_model.clone(),
    ));

    // --- 4. Tool Servers ---
    let tools = Arc::new(ToolServerManager::new(
        config.tool_servers(),
        Arc::new(ChildProcessLauncher),
        config.manager_timeouts(),
    ));
    let starter = tools.clone();
    tokio::task::spawn_blocking(move || starter.start())
        .await?
        .context("Failed to start the tool-server worker")?;
    preconnect(&tools);

    // --- 5. Answer Backends ---
    let weather: Arc<dyn WeatherBackend> = if config.weather_via_tool_server {
        info!("Weather is served by the weather tool server.");
        Arc::new(ToolServerWeather::new(tools.clone()))
    } else {
        let api_key = config.openweather_api_key.clone().unwrap_or_else(|| {
            warn!("OPENWEATHER_API_KEY is not set; weather questions will get an apology.");
            String::new()
        });
        Arc::new(OpenWeatherClient::new(api_key))
    };

    let retriever: Arc<dyn Retriever> = match &config.supabase {
        Some(supabase) => Arc::new(SupabaseRetriever::new(
            llm_config,
            config.embedding_model.clone(),
            &supabase.url,
            supabase.key.clone(),
            supabase.table.clone(),
        )),
        None => {
            warn!("Supabase is not configured; knowledge questions are answered from history only.");
            Arc::new(EmptyRetriever)
        }
    };

    let classifier = Arc::new(IntentClassifier::new(
        intent_llm,
        answer_llm.clone(),
        vision_llm,
    ));
    let router = Arc::new(IntentRouter::new(
        answer_llm,
        weather,
        retriever,
        tools.clone(),
        RouterSettings {
            top_k: config.top_k,
            modality: OutputModality::TextAndAudio,
        },
    ));

    let app_state = Arc::new(AppState {
        config: Arc::new(config.clone()),
        classifier,
        router,
        tools: tools.clone(),
    });

    // --- 6. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 7. Start Server ---
    info!(
        model = %config.chat_model,
        intent_model = %config.intent_model,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tokio::task::spawn_blocking(move || tools.stop()).await?;
    info!("Server has shut down.");
    Ok(())
}
