use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use url::Url;

use crate::models::ProviderId;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
pub const DEFAULT_TITLE_MODEL: &str = "gpt-4o-mini";

/// Attachment and token limits applied to inbound chat requests.
#[derive(Debug, Clone)]
pub struct Limits {
    pub max_images_per_message: usize,
    pub max_image_size: usize,
    pub max_input_tokens: usize,
    pub max_output_tokens: u32,
    pub max_history_tokens: usize,
}

impl Limits {
    /// Crude token-to-character proxy: four characters per token.
    pub fn max_input_chars(&self) -> usize {
        self.max_input_tokens.saturating_mul(4)
    }

    pub fn max_history_chars(&self) -> usize {
        self.max_history_tokens.saturating_mul(4)
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_images_per_message: 1,
            max_image_size: 10 * 1024 * 1024,
            max_input_tokens: 4096,
            max_output_tokens: 2048,
            max_history_tokens: 8192,
        }
    }
}

#[derive(Clone)]
pub struct ProviderCredentials {
    pub api_key: String,
    pub base_url: Option<String>,
}

impl std::fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("api_key", &"***")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub database_path: PathBuf,
    pub public_base_url: Url,
    pub allowed_origins: Vec<String>,
    pub jwt_secret: String,
    pub openai: Option<ProviderCredentials>,
    pub anthropic: Option<ProviderCredentials>,
    pub google: Option<ProviderCredentials>,
    pub limits: Limits,
    pub system_prompt: String,
    pub title_model: String,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("database_path", &self.database_path)
            .field("public_base_url", &self.public_base_url.as_str())
            .field("allowed_origins", &self.allowed_origins)
            .field("jwt_secret", &"***")
            .field("openai", &self.openai)
            .field("anthropic", &self.anthropic)
            .field("google", &self.google)
            .field("limits", &self.limits)
            .field("title_model", &self.title_model)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key lookup. `from_env` passes the process
    /// environment; tests pass a map.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind_addr: SocketAddr = get("BIND_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse()
            .context("BIND_ADDR is not a socket address")?;

        let database_path = match get("DATABASE_PATH") {
            Some(p) => PathBuf::from(p),
            None => default_database_path(&get)?,
        };

        let public_base_url = Url::parse(
            &get("PUBLIC_BASE_URL").unwrap_or_else(|| "http://localhost:8080".to_string()),
        )
        .context("PUBLIC_BASE_URL is not a valid URL")?;

        let allowed_origins = parse_origins(get("ALLOWED_ORIGINS").as_deref().unwrap_or(""));

        let jwt_secret = get("AUTH_JWT_SECRET").context("AUTH_JWT_SECRET must be set")?;

        let credentials = |key_var: &str, url_var: &str| {
            get(key_var).map(|api_key| ProviderCredentials {
                api_key,
                base_url: get(url_var),
            })
        };

        let defaults = Limits::default();
        let limits = Limits {
            max_images_per_message: parse_or(&get, "MAX_IMAGES_PER_MESSAGE", defaults.max_images_per_message)?,
            max_image_size: parse_or(&get, "MAX_IMAGE_SIZE", defaults.max_image_size)?,
            max_input_tokens: parse_or(&get, "MAX_INPUT_TOKENS", defaults.max_input_tokens)?,
            max_output_tokens: parse_or(&get, "MAX_OUTPUT_TOKENS", defaults.max_output_tokens)?,
            max_history_tokens: parse_or(&get, "MAX_HISTORY_TOKENS", defaults.max_history_tokens)?,
        };

        Ok(Self {
            bind_addr,
            database_path,
            public_base_url,
            allowed_origins,
            jwt_secret,
            openai: credentials("OPENAI_API_KEY", "OPENAI_BASE_URL"),
            anthropic: credentials("ANTHROPIC_API_KEY", "ANTHROPIC_BASE_URL"),
            google: credentials("GOOGLE_API_KEY", "GOOGLE_BASE_URL"),
            limits,
            system_prompt: get("SYSTEM_PROMPT").unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            title_model: get("TITLE_MODEL").unwrap_or_else(|| DEFAULT_TITLE_MODEL.to_string()),
        })
    }

    pub fn credentials(&self, provider: ProviderId) -> Option<&ProviderCredentials> {
        match provider {
            ProviderId::OpenAi => self.openai.as_ref(),
            ProviderId::Anthropic => self.anthropic.as_ref(),
            ProviderId::Google => self.google.as_ref(),
        }
    }

    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|o| o == origin)
    }
}

fn default_database_path<F>(get: &F) -> Result<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    let data_dir = match get("XDG_DATA_HOME") {
        Some(dir) => PathBuf::from(dir),
        None => {
            let home = get("HOME").context("neither DATABASE_PATH nor HOME is set")?;
            PathBuf::from(home).join(".local/share")
        }
    };
    Ok(data_dir.join("chatrelay").join("chatrelay.db"))
}

fn parse_or<F, T>(get: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {}", key, raw)),
        None => Ok(default),
    }
}

pub fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|o| o.trim())
        .filter(|o| !o.is_empty())
        .map(|o| o.to_string())
        .collect()
}
