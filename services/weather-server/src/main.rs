//! Stdio tool server exposing OpenWeather lookups as the `query_weather` tool.
//!
//! Launched by the API service's connection manager; logs go to stderr
//! because stdout carries the protocol.

mod server;

use anyhow::Context;
use clap::Parser;
use parley_core::weather::OpenWeatherClient;
use rmcp::{ServiceExt, transport::stdio};
use server::WeatherToolServer;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Unit system passed to OpenWeather.
    #[arg(long, default_value = "metric")]
    units: String,
    /// Language of condition descriptions.
    #[arg(long, default_value = "zh_cn")]
    lang: String,
    /// Country code appended to city lookups.
    #[arg(long, default_value = "CN")]
    country: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();

    let api_key = std::env::var("OPENWEATHER_API_KEY").context("OPENWEATHER_API_KEY must be set")?;
    let backend = OpenWeatherClient::new(api_key).with_locale(&args.country, &args.units, &args.lang);

    info!(?args, "Starting weather tool server on stdio");
    let service = WeatherToolServer::new(Arc::new(backend))
        .serve(stdio())
        .await
        .inspect_err(|e| error!(error = ?e, "Tool server handshake failed"))?;
    service.waiting().await?;
    info!("Weather tool server stopped");
    Ok(())
}
