use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const LIVE_SERVER: &str = "https://api.settle.eu";
pub const DEFAULT_TEST_SERVER: &str = "https://api-dot-settle-core-demo.appspot.com";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("required setting `{0}` is empty")]
    Missing(&'static str),
    #[error("private and public key must be configured together")]
    IncompleteKeyPair,
    #[error("store currency {0} is not supported by Settle")]
    UnsupportedCurrency(String),
}

/// Merchant RSA key pair. Only ever present as a whole.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyPair {
    pub private_pem: String,
    pub public_pem: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SettleSettings {
    #[serde(default)]
    pub merchant_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub priv_key: String,
    #[serde(default)]
    pub pub_key: String,
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default = "default_test_server")]
    pub test_server: String,
    #[serde(default)]
    pub testbed_token: String,
    #[serde(default = "default_true")]
    pub autocapture: bool,
    #[serde(default)]
    pub logging: bool,
    #[serde(default = "default_settle_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_scope_poll_interval", with = "humantime_serde")]
    pub scope_poll_interval: Duration,
    #[serde(default = "default_scope_poll_attempts")]
    pub scope_poll_attempts: u32,
    #[serde(default = "default_scope_wait_timeout", with = "humantime_serde")]
    pub scope_wait_timeout: Duration,
    #[serde(default)]
    pub callback_url: String,
    #[serde(default = "default_return_url_template")]
    pub return_url_template: String,
    #[serde(default = "default_cancel_url_template")]
    pub cancel_url_template: String,
    // Callback signature checks; off unless a verifier is configured
    #[serde(default)]
    pub verify_callbacks: bool,
    #[serde(default)]
    pub callback_secret: String,
    #[serde(default = "default_signature_tolerance_seconds")]
    pub signature_tolerance_seconds: i64,
}

impl Default for SettleSettings {
    fn default() -> Self {
        Self {
            merchant_id: String::new(),
            user_id: String::new(),
            api_secret: String::new(),
            priv_key: String::new(),
            pub_key: String::new(),
            test_mode: false,
            test_server: default_test_server(),
            testbed_token: String::new(),
            autocapture: true,
            logging: false,
            timeout_ms: default_settle_timeout_ms(),
            scope_poll_interval: default_scope_poll_interval(),
            scope_poll_attempts: default_scope_poll_attempts(),
            scope_wait_timeout: default_scope_wait_timeout(),
            callback_url: String::new(),
            return_url_template: default_return_url_template(),
            cancel_url_template: default_cancel_url_template(),
            verify_callbacks: false,
            callback_secret: String::new(),
            signature_tolerance_seconds: default_signature_tolerance_seconds(),
        }
    }
}

impl SettleSettings {
    /// Provider base URL without trailing slash.
    pub fn server_base_url(&self) -> String {
        if self.test_mode {
            self.test_server.trim_end_matches('/').to_string()
        } else {
            LIVE_SERVER.to_string()
        }
    }

    /// TLS verification may only be relaxed against the test server.
    pub fn accept_invalid_certs(&self) -> bool {
        self.test_mode
    }

    pub fn key_pair(&self) -> Result<Option<KeyPair>, ConfigError> {
        match (self.priv_key.trim().is_empty(), self.pub_key.trim().is_empty()) {
            (true, true) => Ok(None),
            (false, false) => Ok(Some(KeyPair {
                private_pem: self.priv_key.clone(),
                public_pem: self.pub_key.clone(),
            })),
            _ => Err(ConfigError::IncompleteKeyPair),
        }
    }

    pub fn return_url(&self, order_id: &str) -> String {
        self.return_url_template.replace("{order_id}", order_id)
    }

    pub fn cancel_url(&self, order_id: &str) -> String {
        self.cancel_url_template.replace("{order_id}", order_id)
    }

    /// Gateway is only enabled when the merchant credentials are present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.merchant_id.trim().is_empty() {
            return Err(ConfigError::Missing("merchant_id"));
        }
        if self.user_id.trim().is_empty() {
            return Err(ConfigError::Missing("user_id"));
        }
        if self.api_secret.trim().is_empty() {
            return Err(ConfigError::Missing("api_secret"));
        }
        if self.priv_key.trim().is_empty() {
            return Err(ConfigError::Missing("priv_key"));
        }
        self.key_pair()?;
        if self.callback_url.trim().is_empty() {
            return Err(ConfigError::Missing("callback_url"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub settle: SettleSettings,
    pub server_port: u16,
    pub database_path: String,
    pub store_currency: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            settle: SettleSettings::default(),
            server_port: 8080,
            database_path: "data/orders.redb".to_string(),
            store_currency: "NOK".to_string(),
        }
    }
}

impl Config {
    /// Load from config.toml (if present) and environment variables.
    /// Environment variables override file values.
    /// Supported env keys: SETTLE_MERCHANT_ID, SETTLE_USER_ID, SETTLE_API_SECRET,
    /// SETTLE_PRIV_KEY, SETTLE_PUB_KEY, SETTLE_TEST_MODE, SETTLE_TEST_SERVER,
    /// SETTLE_TESTBED_TOKEN, SETTLE_AUTOCAPTURE, SETTLE_LOGGING, SETTLE_TIMEOUT_MS,
    /// SETTLE_SCOPE_POLL_INTERVAL, SETTLE_SCOPE_POLL_ATTEMPTS, SETTLE_CALLBACK_URL,
    /// SETTLE_VERIFY_CALLBACKS, SETTLE_CALLBACK_SECRET, SERVER_PORT, DATABASE_PATH,
    /// STORE_CURRENCY
    pub fn load() -> Self {
        // 1) Start with defaults + config.toml only if it exists
        let base: Config = Default::default();
        let mut fig = Figment::from(Serialized::defaults(base));
        if std::path::Path::new("config.toml").exists() {
            fig = fig.merge(Toml::file("config.toml"));
        }
        let mut cfg: Config = fig.extract().unwrap_or_default();

        // 2) Overlay environment variables explicitly
        cfg.apply_env(|key| std::env::var(key).ok());
        cfg
    }

    fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let s = &mut self.settle;
        if let Some(v) = var("SETTLE_MERCHANT_ID") {
            s.merchant_id = v;
        }
        if let Some(v) = var("SETTLE_USER_ID") {
            s.user_id = v;
        }
        if let Some(v) = var("SETTLE_API_SECRET") {
            s.api_secret = v;
        }
        if let Some(v) = var("SETTLE_PRIV_KEY") {
            s.priv_key = v;
        }
        if let Some(v) = var("SETTLE_PUB_KEY") {
            s.pub_key = v;
        }
        if let Some(v) = var("SETTLE_TEST_MODE") {
            s.test_mode = parse_flag(&v);
        }
        if let Some(v) = var("SETTLE_TEST_SERVER") {
            s.test_server = v;
        }
        if let Some(v) = var("SETTLE_TESTBED_TOKEN") {
            s.testbed_token = v;
        }
        if let Some(v) = var("SETTLE_AUTOCAPTURE") {
            s.autocapture = parse_flag(&v);
        }
        if let Some(v) = var("SETTLE_LOGGING") {
            s.logging = parse_flag(&v);
        }
        if let Some(v) = var("SETTLE_TIMEOUT_MS") {
            s.timeout_ms = v.parse().unwrap_or(s.timeout_ms);
        }
        if let Some(v) = var("SETTLE_SCOPE_POLL_INTERVAL") {
            s.scope_poll_interval = parse_duration_env(&v, s.scope_poll_interval);
        }
        if let Some(v) = var("SETTLE_SCOPE_POLL_ATTEMPTS") {
            s.scope_poll_attempts = v.parse().unwrap_or(s.scope_poll_attempts);
        }
        if let Some(v) = var("SETTLE_CALLBACK_URL") {
            s.callback_url = v;
        }
        if let Some(v) = var("SETTLE_VERIFY_CALLBACKS") {
            s.verify_callbacks = parse_flag(&v);
        }
        if let Some(v) = var("SETTLE_CALLBACK_SECRET") {
            s.callback_secret = v;
        }
        if let Some(v) = var("SERVER_PORT") {
            self.server_port = v.parse().unwrap_or(self.server_port);
        }
        if let Some(v) = var("DATABASE_PATH") {
            self.database_path = v;
        }
        if let Some(v) = var("STORE_CURRENCY") {
            self.store_currency = v;
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "yes" | "YES")
}

fn parse_duration_env(value: &str, current: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(current)
}

fn default_true() -> bool {
    true
}

fn default_test_server() -> String {
    DEFAULT_TEST_SERVER.to_string()
}

fn default_settle_timeout_ms() -> u64 {
    15_000
}

fn default_scope_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_scope_poll_attempts() -> u32 {
    5
}

fn default_scope_wait_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_return_url_template() -> String {
    "https://shop.example/checkout/order-received/{order_id}".to_string()
}

fn default_cancel_url_template() -> String {
    "https://shop.example/cart/?cancel_order={order_id}".to_string()
}

fn default_signature_tolerance_seconds() -> i64 {
    300 // 5 minutes
}
