use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::env;
use std::path::Path;

pub const PRODUCTION_REST_URL: &str = "https://api.binance.com";
pub const PRODUCTION_WS_URL: &str = "wss://stream.binance.com:9443";
pub const TESTNET_REST_URL: &str = "https://testnet.binance.vision";
pub const TESTNET_WS_URL: &str = "wss://testnet.binance.vision";

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_RECV_WINDOW_MS: u64 = 5000;

/// Immutable connection settings shared by the REST and streaming transports.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub api_key: Secret<String>,
    pub secret_key: Secret<String>,
    pub testnet: bool,
    pub base_url: Option<String>,
    pub ws_base_url: Option<String>,
    pub timeout_seconds: u64,
    pub recv_window: Option<u64>,
}

// Custom Serialize implementation - never expose secrets in serialization
impl Serialize for ExchangeConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("ExchangeConfig", 7)?;
        state.serialize_field("api_key", "[REDACTED]")?;
        state.serialize_field("secret_key", "[REDACTED]")?;
        state.serialize_field("testnet", &self.testnet)?;
        state.serialize_field("base_url", &self.base_url)?;
        state.serialize_field("ws_base_url", &self.ws_base_url)?;
        state.serialize_field("timeout_seconds", &self.timeout_seconds)?;
        state.serialize_field("recv_window", &self.recv_window)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for ExchangeConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct ExchangeConfigHelper {
            api_key: String,
            secret_key: String,
            #[serde(default)]
            testnet: bool,
            base_url: Option<String>,
            ws_base_url: Option<String>,
            timeout_seconds: Option<u64>,
            recv_window: Option<u64>,
        }

        let helper = ExchangeConfigHelper::deserialize(deserializer)?;
        Ok(Self {
            api_key: Secret::new(helper.api_key),
            secret_key: Secret::new(helper.secret_key),
            testnet: helper.testnet,
            base_url: helper.base_url,
            ws_base_url: helper.ws_base_url,
            timeout_seconds: helper.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS),
            recv_window: helper.recv_window,
        })
    }
}

impl ExchangeConfig {
    /// Create a new configuration with API credentials
    #[must_use]
    pub fn new(api_key: String, secret_key: String) -> Self {
        Self {
            api_key: Secret::new(api_key),
            secret_key: Secret::new(secret_key),
            testnet: false,
            base_url: None,
            ws_base_url: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            recv_window: None,
        }
    }

    /// Create configuration from environment variables
    ///
    /// Expected environment variables:
    /// - `{EXCHANGE}_API_KEY` (e.g., `BINANCE_API_KEY`)
    /// - `{EXCHANGE}_SECRET_KEY` (e.g., `BINANCE_SECRET_KEY`)
    /// - `{EXCHANGE}_TESTNET` (optional, defaults to false)
    /// - `{EXCHANGE}_BASE_URL` (optional)
    /// - `{EXCHANGE}_WS_BASE_URL` (optional)
    /// - `{EXCHANGE}_TIMEOUT` (optional, seconds)
    /// - `{EXCHANGE}_RECV_WINDOW` (optional, milliseconds)
    pub fn from_env(exchange_prefix: &str) -> Result<Self, ConfigError> {
        let prefix = exchange_prefix.to_uppercase();
        let var = |suffix: &str| format!("{}_{}", prefix, suffix);

        let api_key_var = var("API_KEY");
        let secret_key_var = var("SECRET_KEY");

        let api_key = env::var(&api_key_var)
            .map_err(|_| ConfigError::MissingEnvironmentVariable(api_key_var))?;

        let secret_key = env::var(&secret_key_var)
            .map_err(|_| ConfigError::MissingEnvironmentVariable(secret_key_var))?;

        let testnet = env::var(var("TESTNET"))
            .unwrap_or_else(|_| "false".to_string())
            .parse::<bool>()
            .unwrap_or(false);

        let timeout_seconds = parse_optional_u64(&var("TIMEOUT"))?.unwrap_or(DEFAULT_TIMEOUT_SECONDS);
        let recv_window = parse_optional_u64(&var("RECV_WINDOW"))?;

        Ok(Self {
            api_key: Secret::new(api_key),
            secret_key: Secret::new(secret_key),
            testnet,
            base_url: env::var(var("BASE_URL")).ok(),
            ws_base_url: env::var(var("WS_BASE_URL")).ok(),
            timeout_seconds,
            recv_window,
        })
    }

    /// Create configuration from .env file and environment variables
    ///
    /// **Security Warning**: Never commit .env files to version control!
    #[cfg(feature = "env-file")]
    pub fn from_env_file(exchange_prefix: &str) -> Result<Self, ConfigError> {
        Self::from_env_file_with_path(exchange_prefix, ".env")
    }

    /// Create configuration from a specific .env file path
    #[cfg(feature = "env-file")]
    pub fn from_env_file_with_path(
        exchange_prefix: &str,
        env_file_path: &str,
    ) -> Result<Self, ConfigError> {
        match dotenv::from_path(env_file_path) {
            Ok(_) => {}
            Err(dotenv::Error::Io(io_err)) if io_err.kind() == std::io::ErrorKind::NotFound => {
                // fall back to the process environment
            }
            Err(e) => {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "Failed to load .env file '{}': {}",
                    env_file_path, e
                )));
            }
        }

        Self::from_env(exchange_prefix)
    }

    /// Load one named account from a YAML file (see [`AppConfig`]).
    ///
    /// With `account_name` of `None` the first binance account is used.
    pub fn from_yaml_file(
        path: impl AsRef<Path>,
        account_name: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let app = AppConfig::from_yaml_file(path)?;
        let account = match account_name {
            Some(name) => app.binance_account_by_name(name)?,
            None => app.binance_account()?,
        };
        Ok(account.to_exchange_config())
    }

    /// Create configuration for read-only operations (market data only)
    #[must_use]
    pub fn read_only() -> Self {
        Self::new(String::new(), String::new())
    }

    /// Check if this configuration has valid credentials for authenticated operations
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        !self.api_key.expose_secret().is_empty() && !self.secret_key.expose_secret().is_empty()
    }

    /// Set testnet mode
    #[must_use]
    pub const fn testnet(mut self, testnet: bool) -> Self {
        self.testnet = testnet;
        self
    }

    /// Set custom REST base URL
    #[must_use]
    pub fn base_url(mut self, base_url: String) -> Self {
        self.base_url = Some(base_url);
        self
    }

    /// Set custom stream base URL
    #[must_use]
    pub fn ws_base_url(mut self, ws_base_url: String) -> Self {
        self.ws_base_url = Some(ws_base_url);
        self
    }

    #[must_use]
    pub const fn timeout_seconds(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    #[must_use]
    pub const fn recv_window(mut self, recv_window_ms: u64) -> Self {
        self.recv_window = Some(recv_window_ms);
        self
    }

    #[must_use]
    pub const fn with_default_recv_window(self) -> Self {
        self.recv_window(DEFAULT_RECV_WINDOW_MS)
    }

    /// REST base URL after applying the network selection.
    pub fn rest_base_url(&self) -> String {
        self.base_url.clone().unwrap_or_else(|| {
            if self.testnet {
                TESTNET_REST_URL.to_string()
            } else {
                PRODUCTION_REST_URL.to_string()
            }
        })
    }

    /// Stream base URL (scheme, host and port, without `/ws`).
    pub fn stream_base_url(&self) -> String {
        self.ws_base_url
            .clone()
            .unwrap_or_else(|| {
                if self.testnet {
                    TESTNET_WS_URL.to_string()
                } else {
                    PRODUCTION_WS_URL.to_string()
                }
            })
            .trim_end_matches('/')
            .to_string()
    }

    /// Get API key (use carefully - exposes secret)
    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }

    /// Get secret key (use carefully - exposes secret)
    pub fn secret_key(&self) -> &str {
        self.secret_key.expose_secret()
    }
}

fn parse_optional_u64(var_name: &str) -> Result<Option<u64>, ConfigError> {
    match env::var(var_name) {
        Ok(raw) => raw.trim().parse::<u64>().map(Some).map_err(|e| {
            ConfigError::InvalidConfiguration(format!("{} is not a number: {}", var_name, e))
        }),
        Err(_) => Ok(None),
    }
}

/// One account entry of the YAML configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub sandbox: bool,
    /// Request timeout in seconds
    pub timeout: Option<u64>,
    pub base_url: Option<String>,
    pub ws_base_url: Option<String>,
    pub recv_window: Option<u64>,
}

impl AccountConfig {
    pub fn to_exchange_config(&self) -> ExchangeConfig {
        ExchangeConfig {
            api_key: Secret::new(self.api_key.clone()),
            secret_key: Secret::new(self.api_secret.clone()),
            testnet: self.sandbox,
            base_url: self.base_url.clone(),
            ws_base_url: self.ws_base_url.clone(),
            timeout_seconds: self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECONDS),
            recv_window: self.recv_window,
        }
    }
}

/// Application configuration file:
///
/// ```yaml
/// accounts:
///   binance:
///     - name: main
///       api_key: "..."
///       api_secret: "..."
///       sandbox: true
///       timeout: 10
/// market:
///   binance: [BTCUSDT, ETHUSDT]
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub accounts: HashMap<String, Vec<AccountConfig>>,
    #[serde(default)]
    pub market: HashMap<String, Vec<String>>,
}

impl AppConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        ::config::Config::builder()
            .add_source(::config::File::from(path).format(::config::FileFormat::Yaml))
            .build()
            .and_then(::config::Config::try_deserialize)
            .map_err(|e| {
                ConfigError::InvalidConfiguration(format!(
                    "Failed to load config file '{}': {}",
                    path.display(),
                    e
                ))
            })
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        ::config::Config::builder()
            .add_source(::config::File::from_str(yaml, ::config::FileFormat::Yaml))
            .build()
            .and_then(::config::Config::try_deserialize)
            .map_err(|e| ConfigError::InvalidConfiguration(e.to_string()))
    }

    pub fn binance_account(&self) -> Result<&AccountConfig, ConfigError> {
        self.accounts
            .get("binance")
            .and_then(|accounts| accounts.first())
            .ok_or_else(|| ConfigError::AccountNotFound("binance".to_string()))
    }

    pub fn binance_account_by_name(&self, name: &str) -> Result<&AccountConfig, ConfigError> {
        self.accounts
            .get("binance")
            .and_then(|accounts| accounts.iter().find(|a| a.name == name))
            .ok_or_else(|| ConfigError::AccountNotFound(format!("binance/{}", name)))
    }

    pub fn binance_symbols(&self) -> &[String] {
        self.market.get("binance").map_or(&[], Vec::as_slice)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvironmentVariable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),
}
