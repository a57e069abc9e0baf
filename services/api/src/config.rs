use parley_core::tools::{
    FINANCIAL_SERVER, ManagerTimeouts, ToolServerConfig, WEATHER_SERVER,
};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;

pub const DEFAULT_LLM_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Connection details for the Supabase document store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SupabaseConfig {
    pub url: String,
    pub key: String,
    pub table: String,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub llm_api_key: String,
    pub llm_base_url: String,
    /// Answer model; also transcribes audio.
    pub chat_model: String,
    pub intent_model: String,
    pub vision_model: String,
    pub embedding_model: String,
    pub voice: String,
    pub openweather_api_key: Option<String>,
    /// Fetch weather through the `weather` tool server instead of calling
    /// OpenWeather directly.
    pub weather_via_tool_server: bool,
    pub supabase: Option<SupabaseConfig>,
    pub history_pairs: usize,
    pub top_k: usize,
    pub connect_timeout: Duration,
    pub tool_call_timeout: Duration,
    pub weather_tool_server_cmd: String,
    pub financial_tool_server_cmd: String,
    pub log_level: Level,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str = var_or("BIND_ADDRESS", "0.0.0.0:8000");
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let llm_api_key = optional_var("LLM_API_KEY")
            .ok_or_else(|| ConfigError::MissingVar("LLM_API_KEY".to_string()))?;

        let supabase = match (optional_var("SUPABASE_URL"), optional_var("SUPABASE_KEY")) {
            (Some(url), Some(key)) => Some(SupabaseConfig {
                url,
                key,
                table: var_or("DOCUMENT_TABLE", "testdoc"),
            }),
            (Some(_), None) => return Err(ConfigError::MissingVar("SUPABASE_KEY".to_string())),
            _ => None,
        };

        let history_pairs = parse_var("HISTORY_PAIRS", 5usize)?;
        if history_pairs == 0 {
            return Err(ConfigError::InvalidValue(
                "HISTORY_PAIRS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            llm_api_key,
            llm_base_url: var_or("LLM_BASE_URL", DEFAULT_LLM_BASE_URL),
            chat_model: var_or("CHAT_MODEL", "qwen-omni-turbo"),
            intent_model: var_or("INTENT_MODEL", "qwen3-8b"),
            vision_model: var_or("VISION_MODEL", "qwen-vl-plus"),
            embedding_model: var_or("EMBEDDING_MODEL", "text-embedding-v1"),
            voice: var_or("VOICE", "Chelsie"),
            openweather_api_key: optional_var("OPENWEATHER_API_KEY"),
            weather_via_tool_server: parse_var("WEATHER_VIA_TOOL_SERVER", false)?,
            supabase,
            history_pairs,
            top_k: parse_var("RETRIEVAL_TOP_K", 3usize)?,
            connect_timeout: Duration::from_millis(parse_var("CONNECT_TIMEOUT_MS", 3000u64)?),
            tool_call_timeout: Duration::from_millis(parse_var("TOOL_CALL_TIMEOUT_MS", 2000u64)?),
            weather_tool_server_cmd: var_or("WEATHER_TOOL_SERVER_CMD", "parley-weather-server"),
            financial_tool_server_cmd: var_or(
                "FINANCIAL_TOOL_SERVER_CMD",
                "python mcpserver/FinancialMCPServer.py",
            ),
            log_level,
        })
    }

    /// The tool servers the connection manager may launch. A blank command
    /// line leaves that server unconfigured.
    pub fn tool_servers(&self) -> Vec<ToolServerConfig> {
        [
            ToolServerConfig::from_command_line(
                WEATHER_SERVER,
                &self.weather_tool_server_cmd,
                "Current conditions and forecasts by city",
            ),
            ToolServerConfig::from_command_line(
                FINANCIAL_SERVER,
                &self.financial_tool_server_cmd,
                "Company financial reports",
            ),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    pub fn manager_timeouts(&self) -> ManagerTimeouts {
        ManagerTimeouts {
            connect: self.connect_timeout,
            tool_call: self.tool_call_timeout,
            ..ManagerTimeouts::default()
        }
    }
}
