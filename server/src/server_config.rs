use config::{Config, ConfigError};
use serde::Deserialize;
use std::{env, path::Path, result::Result, time::Duration};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub port: u16,
    pub request_timeout_secs: u64,
    /// Production deployments are served over TLS and get `Secure` cookies
    pub production: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleOAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub auth_uri: String,
    pub token_uri: String,
    pub userinfo_uri: String,
    #[serde(default)]
    pub revoke_uri: Option<String>,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Base64 encoded key material (at least 64 bytes) for the private cookie jar
    #[serde(default)]
    pub cookie_key: Option<String>,
    pub refresh_cookie_days: i64,
    pub refresh_reuse_secs: u64,
    /// Host the cookies are scoped to
    pub public_host: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GmailApiConfig {
    pub api_base: String,
    pub default_query: String,
    pub max_results_cap: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptLimits {
    pub rate_limit_per_sec: usize,
    pub refill_interval_ms: usize,
    pub refill_amount: usize,
    /// How long a rate limit answer from the provider pauses new prompts
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
}

fn default_backoff_secs() -> u64 {
    60
}

impl PromptLimits {
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f64,
    pub timeout_ms: u64,
    pub max_body_chars: usize,
    pub prompt_limits: PromptLimits,
}

impl ExtractionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum PacingConfig {
    None,
    Fixed { delay_ms: u64 },
    TokenBucket { per_second: usize },
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    pub default_chunk_size: usize,
    pub max_chunk_size: usize,
    pub item_timeout_ms: u64,
    pub deadline_ms: u64,
    pub pacing: PacingConfig,
}

impl BatchConfig {
    pub fn item_timeout(&self) -> Duration {
        Duration::from_millis(self.item_timeout_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrontendConfig {
    pub base_url: Url,
    pub home_path: String,
    pub login_path: String,
}

impl FrontendConfig {
    pub fn get_home_url(&self) -> Url {
        let mut url = self.base_url.clone();
        url.set_path(&self.home_path);
        url
    }

    pub fn get_signin_url(&self) -> Url {
        let mut url = self.base_url.clone();
        url.set_path(&self.login_path);
        url
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub server: ServerSettings,
    pub oauth: GoogleOAuthConfig,
    pub session: SessionConfig,
    pub gmail: GmailApiConfig,
    pub extraction: ExtractionConfig,
    pub batch: BatchConfig,
    pub frontend: FrontendConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl ServerConfig {
    /// Loads `config.toml`, then the optional `client_secret.toml`, then
    /// `APP__SECTION__KEY` environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_dir(&config_dir())
    }

    pub fn from_dir(root: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(config::File::with_name(&format!("{root}/config.toml")))
            .add_source(
                config::File::with_name(&format!("{root}/client_secret.toml")).required(false),
            )
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

fn config_dir() -> String {
    env::var("APP_DIR").unwrap_or_else(|_| {
        let dir = env!("CARGO_MANIFEST_DIR");
        let parent = Path::new(dir)
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| ".".to_string());
        format!("{parent}/config")
    })
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

impl std::fmt::Display for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Server Config:\n{:?}\n\nOAuth: client_id={} client_secret={} token_uri={} redirect_uri={} scopes=[{}]\n\nSession: public_host={} refresh_cookie_days={} refresh_reuse_secs={} cookie_key={}\n\nGmail: {:?}\n\nExtraction: endpoint={} model={} api_key={} timeout_ms={} limits={:?}\n\nBatch: {:?}\n\nFrontend: {}\n\nDatabase: {}",
            self.server,
            self.oauth.client_id,
            redact(&self.oauth.client_secret),
            self.oauth.token_uri,
            self.oauth.redirect_uri,
            self.oauth.scopes.join(" "),
            self.session.public_host,
            self.session.refresh_cookie_days,
            self.session.refresh_reuse_secs,
            redact(self.session.cookie_key.as_deref().unwrap_or_default()),
            self.gmail,
            self.extraction.endpoint,
            self.extraction.model,
            redact(&self.extraction.api_key),
            self.extraction.timeout_ms,
            self.extraction.prompt_limits,
            self.batch,
            self.frontend.base_url,
            if self.database.url.is_some() { "postgres" } else { "in-memory" },
        )
    }
}
