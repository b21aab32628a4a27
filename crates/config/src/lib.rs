use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Service configuration, loaded from an optional `config.toml` under the
/// user config dir and overlaid with environment variables. Environment
/// always wins so deployments can be driven entirely from the process env.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub models: ModelRoutesConfig,
    #[serde(default)]
    pub providers: ProviderCredentials,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Allowed CORS origins. Empty list means the local dev origin only.
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_allowed_origins: Vec::new(),
        }
    }
}

pub const LOCAL_DEV_ORIGIN: &str = "http://localhost:5173";

impl ServerConfig {
    pub fn effective_origins(&self) -> Vec<String> {
        if self.cors_allowed_origins.is_empty() {
            vec![LOCAL_DEV_ORIGIN.to_string()]
        } else {
            self.cors_allowed_origins.clone()
        }
    }
}

/// Per-role model id lists. Each entry is an ordered fallback chain; the
/// router tries ids front to back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelRoutesConfig {
    #[serde(default)]
    pub intake: Vec<String>,
    #[serde(default)]
    pub planner: Vec<String>,
    #[serde(default)]
    pub coder: Vec<String>,
    #[serde(default)]
    pub pr_narrator: Vec<String>,
    #[serde(default)]
    pub orchestrator: Vec<String>,
    #[serde(default)]
    pub embedding: Vec<String>,
}

/// API credentials per provider, keyed by provider id ("openai",
/// "anthropic", "aimlapi", ...). Values may also arrive via the
/// conventional `<PROVIDER>_API_KEY` env vars.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderCredentials {
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
    #[serde(default)]
    pub base_urls: HashMap<String, String>,
}

impl ProviderCredentials {
    pub fn api_key(&self, provider: &str) -> Option<String> {
        if let Some(key) = self.api_keys.get(provider) {
            return Some(key.clone());
        }
        let env_var = format!("{}_API_KEY", provider.to_uppercase().replace('-', "_"));
        std::env::var(env_var).ok()
    }

    pub fn base_url(&self, provider: &str) -> Option<String> {
        self.base_urls.get(provider).cloned()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_author_name")]
    pub author_name: String,
    #[serde(default = "default_author_email")]
    pub author_email: String,
    /// Directory that cloned working copies are placed under.
    #[serde(default = "default_clone_dir")]
    pub clone_dir: PathBuf,
}

fn default_author_name() -> String {
    "Refactory Bot".to_string()
}

fn default_author_email() -> String {
    "bot@refactory.dev".to_string()
}

fn default_clone_dir() -> PathBuf {
    PathBuf::from("cloned_repos")
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            author_name: default_author_name(),
            author_email: default_author_email(),
            clone_dir: default_clone_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Plan steps per streamed transformer call. <= 0 means all at once.
    #[serde(default = "default_batch_size")]
    pub batch_size: i32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub auto_fix_enabled: bool,
    #[serde(default = "default_min_test_coverage")]
    pub min_test_coverage: f64,
    /// Seconds to wait on a confirmation gate before giving up.
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
}

fn default_batch_size() -> i32 {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_min_test_coverage() -> f64 {
    0.5
}

fn default_confirmation_timeout_secs() -> u64 {
    3600
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            auto_fix_enabled: default_true(),
            min_test_coverage: default_min_test_coverage(),
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
        }
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

impl Config {
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("refactory")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Read the config file if present, then overlay environment variables.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config: {}", path.display()))?
        } else {
            Config::default()
        };
        config.apply_env();
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Ok(origins) = std::env::var("CORS_ALLOWED_ORIGINS") {
            self.server.cors_allowed_origins = split_csv(&origins);
        }
        for (var, route) in [
            ("MODEL_ROUTE_INTAKE", &mut self.models.intake),
            ("MODEL_ROUTE_PLANNER", &mut self.models.planner),
            ("MODEL_ROUTE_CODER", &mut self.models.coder),
            ("MODEL_ROUTE_PR", &mut self.models.pr_narrator),
            ("MODEL_ROUTE_ORCHESTRATOR", &mut self.models.orchestrator),
            ("EMBEDDING_MODEL", &mut self.models.embedding),
        ] {
            if let Ok(value) = std::env::var(var) {
                let ids = split_csv(&value);
                if !ids.is_empty() {
                    *route = ids;
                }
            }
        }
        if let Ok(name) = std::env::var("GIT_AUTHOR_NAME") {
            self.git.author_name = name;
        }
        if let Ok(email) = std::env::var("GIT_AUTHOR_EMAIL") {
            self.git.author_email = email;
        }
        if let Ok(dir) = std::env::var("CLONE_DIR") {
            self.git.clone_dir = PathBuf::from(dir);
        }
    }

    pub fn save(&self) -> Result<()> {
        std::fs::create_dir_all(Self::config_dir())?;
        let content = toml::to_string_pretty(self)?;
        std::fs::write(Self::config_path(), content)?;
        Ok(())
    }
}
