use crate::llm::{LlmSettings, Provider};
use clap::Parser;
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Address to bind
    #[arg(long, env = "HOST")]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// SQLite connection URL
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Model for agents that do not name one
    #[arg(long, env = "DEFAULT_MODEL")]
    pub default_model: Option<String>,

    /// Agent catalog YAML
    #[arg(long, env = "AGENTS_CONFIG")]
    pub agents_config: Option<String>,

    /// `apikey` or `none`
    #[arg(long, env = "AUTH_MODE")]
    pub auth_mode: Option<String>,

    /// Accepted API keys, comma separated
    #[arg(long, env = "API_KEYS", value_delimiter = ',')]
    pub api_keys: Option<Vec<String>>,

    /// MCP servers JSON
    #[arg(long, env = "MCP_CONFIG")]
    pub mcp_config: Option<String>,

    /// `compact` or `json`
    #[arg(long, env = "LOG_FORMAT")]
    pub log_format: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub persistence: PersistenceConfig,
    pub agents: AgentsConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    pub log_format: LogFormat,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    /// Applies to non-streaming requests only.
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    ApiKey,
    None,
}

#[derive(Deserialize, Clone)]
pub struct SecurityConfig {
    pub auth_mode: AuthMode,
    #[serde(default)]
    pub api_keys: Vec<String>,
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("auth_mode", &self.auth_mode)
            .field("api_keys", &format!("<{} redacted>", self.api_keys.len()))
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PersistenceConfig {
    pub database_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentsConfig {
    pub config_path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub default_model: String,
    pub temperature: f64,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    pub request_timeout_secs: u64,
    /// Azure only.
    #[serde(default)]
    pub deployment_name: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ToolsConfig {
    pub mcp_config: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    /// Defaults, then the YAML file, then `ORCH__*` variables, then flags.
    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        let mut builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8000)?
            .set_default("server.request_timeout_secs", 300)?
            .set_default("security.auth_mode", "apikey")?
            .set_default("security.api_keys", Vec::<String>::new())?
            .set_default("persistence.database_url", "sqlite://data/orchestrator.db")?
            .set_default("agents.config_path", "config/agents.yaml")?
            .set_default("llm.base_url", "https://api.openai.com")?
            .set_default("llm.default_model", "gpt-4")?
            .set_default("llm.temperature", 0.7)?
            .set_default("llm.request_timeout_secs", 120)?
            .set_default("log_format", "compact")?;

        match &cli.config {
            Some(path) => {
                builder = builder.add_source(File::new(path, FileFormat::Yaml).required(true));
            }
            None if Path::new("config.yaml").exists() => {
                builder = builder.add_source(File::new("config.yaml", FileFormat::Yaml));
            }
            None => {}
        }

        // ORCH__LLM__DEFAULT_MODEL=gpt-4o
        builder = builder.add_source(
            Environment::with_prefix("ORCH")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("security.api_keys")
                .try_parsing(true),
        );

        if let Some(host) = cli.host {
            builder = builder.set_override("server.host", host)?;
        }
        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", port)?;
        }
        if let Some(url) = cli.database_url {
            builder = builder.set_override("persistence.database_url", url)?;
        }
        if let Some(model) = cli.default_model {
            builder = builder.set_override("llm.default_model", model)?;
        }
        if let Some(path) = cli.agents_config {
            builder = builder.set_override("agents.config_path", path)?;
        }
        if let Some(mode) = cli.auth_mode {
            builder = builder.set_override("security.auth_mode", mode.to_lowercase())?;
        }
        if let Some(keys) = cli.api_keys {
            let keys: Vec<String> = keys
                .into_iter()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect();
            builder = builder.set_override("security.api_keys", keys)?;
        }
        if let Some(path) = cli.mcp_config {
            builder = builder.set_override("tools.mcp_config", path)?;
        }
        if let Some(format) = cli.log_format {
            builder = builder.set_override("log_format", format.to_lowercase())?;
        }

        builder.build()?.try_deserialize()
    }

    /// `host:port`, for binding.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Build provider settings from config plus the credential in the
/// environment (`OPENAI_API_KEY`, else `LLM_API_KEY`).
pub fn load_llm_settings(llm: &LlmConfig) -> LlmSettings {
    let api_key = ["OPENAI_API_KEY", "LLM_API_KEY"]
        .iter()
        .find_map(|name| std::env::var(name).ok().filter(|v| !v.trim().is_empty()));
    llm_settings_with_key(llm, api_key)
}

pub fn llm_settings_with_key(llm: &LlmConfig, api_key: Option<String>) -> LlmSettings {
    let mut provider = Provider::detect_from_url(&llm.base_url);
    if let Provider::AzureOpenAI { api_version, .. } = &provider {
        provider = Provider::AzureOpenAI {
            deployment_name: llm
                .deployment_name
                .clone()
                .unwrap_or_else(|| llm.default_model.clone()),
            api_version: llm.api_version.clone().unwrap_or_else(|| api_version.clone()),
        };
    }

    LlmSettings {
        base_url: llm.base_url.trim().to_string(),
        api_key,
        default_model: llm.default_model.clone(),
        temperature: llm.temperature,
        max_tokens: llm.max_tokens,
        request_timeout: Duration::from_secs(llm.request_timeout_secs),
        provider,
    }
}
