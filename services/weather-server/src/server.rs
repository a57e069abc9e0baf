//! The `query_weather` tool, served over MCP.

use parley_core::weather::{WeatherBackend, WeatherQuery};
use rmcp::{
    ServerHandler,
    handler::server::{router::tool::ToolRouter, tool::Parameters},
    model::{ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Arguments for the `query_weather` tool.
#[derive(Deserialize, JsonSchema, Debug)]
pub struct QueryWeatherArgs {
    /// City name, e.g. "北京".
    pub city: String,
    /// When the weather is wanted.
    #[schemars(description = "'now' for current conditions, 'today', or anything else for a multi-day forecast")]
    pub time: Option<String>,
}

pub struct WeatherToolServer {
    backend: Arc<dyn WeatherBackend>,
    tool_router: ToolRouter<Self>,
}

#[tool_handler]
impl ServerHandler for WeatherToolServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            instructions: Some("Weather lookups by city name.".to_string()),
            ..Default::default()
        }
    }
}

#[tool_router]
impl WeatherToolServer {
    pub fn new(backend: Arc<dyn WeatherBackend>) -> Self {
        Self {
            backend,
            tool_router: Self::tool_router(),
        }
    }

    /// Looks up the weather and returns the report as JSON.
    #[tool(description = "Query current conditions or the forecast for a city.")]
    pub async fn query_weather(&self, args: Parameters<QueryWeatherArgs>) -> Result<String, String> {
        let QueryWeatherArgs { city, time } = args.0;
        let query = WeatherQuery::from_qualifier(time.as_deref());
        info!(%city, query = query.label(), "Executing tool 'query_weather'");

        let report = self.backend.get_weather(&city, query).await.map_err(|e| {
            warn!(%city, error = %e, "Weather lookup failed");
            e.to_string()
        })?;
        serde_json::to_string(&report).map_err(|e| format!("Failed to serialize weather report: {e}"))
    }
}
