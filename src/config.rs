use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::env::VarError;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::warn;

pub(crate) const CONFIG_FILE_NAME: &str = "config.toml";

const HF_ENV_TOKEN_VAR: &str = "HF_TOKEN";

/// Written to the storage root when no configuration exists yet. It must
/// deserialize to `Config::default()`.
pub(crate) const DEFAULT_CONFIG: &str = r#"# modelgate configuration
#
# Providers are tried in the order they are declared whenever a model is
# requested that has no persisted route yet.

[server]
# listen = "127.0.0.1:8000"
# backend_base_port = 8081
# memory_budget = 17179869184
# models_dir = "/var/lib/modelgate/models"

[hub]
# endpoint = "https://huggingface.co"
# token = "hf_..."

# [[providers]]
# name = "openrouter"
# discovery_type = "remote_listing"
# api_base = "https://openrouter.ai/api"
# api_key = "sk-or-..."
#
# [[providers]]
# name = "local"
# discovery_type = "local_quantized"
# binary_path = "/usr/local/bin/llama-server"
#
# [providers.quantization]
# precision = "Q6_K"
# prefer_correct_precision = 100
# prefer_imatrix = 10
# prefer_same_owner = 5
# tiebreak_strategy = "popular"
"#;

#[derive(Error, Debug)]
pub(crate) enum ConfigError {
    #[error("failed to read \"{}\": {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to create \"{}\": {source}", .path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("a provider has an empty name")]
    EmptyProviderName,
    #[error("provider \"{0}\" is declared more than once")]
    DuplicateProvider(String),
    #[error("provider \"{name}\" has an invalid api_base: {reason}")]
    InvalidApiBase { name: String, reason: String },
    #[error("provider \"{0}\" has an empty binary_path")]
    EmptyBinaryPath(String),
    #[error("hub endpoint \"{0}\" is not a valid URL")]
    InvalidHubEndpoint(String),
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub(crate) struct ServerSettings {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_backend_base_port")]
    pub backend_base_port: u16,
    /// Upper bound, in bytes, for the sum of all spawned backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_budget: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models_dir: Option<PathBuf>,
}

fn default_listen() -> String {
    "127.0.0.1:8000".to_string()
}

// llama.cpp's server listens on 8080 unless told otherwise
fn default_backend_base_port() -> u16 {
    8081
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            listen: default_listen(),
            backend_base_port: default_backend_base_port(),
            memory_budget: None,
            models_dir: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub(crate) struct HubSettings {
    #[serde(default = "default_hub_endpoint")]
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

fn default_hub_endpoint() -> String {
    "https://huggingface.co".to_string()
}

impl Default for HubSettings {
    fn default() -> Self {
        HubSettings {
            endpoint: default_hub_endpoint(),
            token: None,
        }
    }
}

impl HubSettings {
    /// The configured token, falling back to `$HF_TOKEN`.
    pub(crate) fn token(&self) -> Option<String> {
        if let Some(token) = &self.token {
            return Some(token.clone());
        }

        match std::env::var(HF_ENV_TOKEN_VAR) {
            Ok(token) if !token.is_empty() => Some(token),
            Ok(_) => None,
            Err(VarError::NotPresent) => None,
            Err(VarError::NotUnicode(_)) => {
                tracing::warn!("ignoring {}: not valid unicode", HF_ENV_TOKEN_VAR);
                None
            }
        }
    }
}

#[derive(
    Deserialize,
    Serialize,
    Default,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub(crate) enum TiebreakStrategy {
    /// Uniformly random among the best candidates
    Random,
    /// The candidate from the most downloaded repository
    #[default]
    Popular,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub(crate) struct QuantizationPreferences {
    #[serde(default = "default_precision")]
    pub precision: String,
    #[serde(default = "default_prefer_correct_precision")]
    pub prefer_correct_precision: i64,
    #[serde(default = "default_prefer_imatrix")]
    pub prefer_imatrix: i64,
    #[serde(default = "default_prefer_same_owner")]
    pub prefer_same_owner: i64,
    #[serde(default)]
    pub tiebreak_strategy: TiebreakStrategy,
}

fn default_precision() -> String {
    "Q6_K".to_string()
}

fn default_prefer_correct_precision() -> i64 {
    100
}

fn default_prefer_imatrix() -> i64 {
    10
}

fn default_prefer_same_owner() -> i64 {
    5
}

impl Default for QuantizationPreferences {
    fn default() -> Self {
        QuantizationPreferences {
            precision: default_precision(),
            prefer_correct_precision: default_prefer_correct_precision(),
            prefer_imatrix: default_prefer_imatrix(),
            prefer_same_owner: default_prefer_same_owner(),
            tiebreak_strategy: TiebreakStrategy::default(),
        }
    }
}

/// An upstream with an OpenAI-compatible `/v1/models` listing.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub(crate) struct RemoteProvider {
    pub api_base: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: serde_json::Map<String, serde_json::Value>,
}

/// Quantized weights pulled from the hub and served by a locally spawned
/// inference binary.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub(crate) struct LocalProvider {
    pub binary_path: String,
    /// Flags passed before `--port` and `--model`
    #[serde(default = "default_binary_args")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub quantization: QuantizationPreferences,
}

fn default_binary_args() -> Vec<String> {
    vec!["--host".to_string(), "127.0.0.1".to_string()]
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "discovery_type", rename_all = "snake_case")]
pub(crate) enum Provider {
    RemoteListing(RemoteProvider),
    LocalQuantized(LocalProvider),
}

impl Provider {
    pub(crate) fn api_base(&self) -> Option<&str> {
        match self {
            Provider::RemoteListing(remote) => Some(&remote.api_base),
            Provider::LocalQuantized(_) => None,
        }
    }

    pub(crate) fn api_key(&self) -> Option<&str> {
        match self {
            Provider::RemoteListing(remote) => remote.api_key.as_deref(),
            Provider::LocalQuantized(local) => local.api_key.as_deref(),
        }
    }

    pub(crate) fn headers(&self) -> &BTreeMap<String, String> {
        match self {
            Provider::RemoteListing(remote) => &remote.headers,
            Provider::LocalQuantized(local) => &local.headers,
        }
    }

    pub(crate) fn body(&self) -> &serde_json::Map<String, serde_json::Value> {
        match self {
            Provider::RemoteListing(remote) => &remote.body,
            Provider::LocalQuantized(local) => &local.body,
        }
    }

    pub(crate) fn discovery_type(&self) -> &'static str {
        match self {
            Provider::RemoteListing(_) => "remote_listing",
            Provider::LocalQuantized(_) => "local_quantized",
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub(crate) struct ProviderConfig {
    pub name: String,
    #[serde(flatten)]
    pub provider: Provider,
}

#[derive(Deserialize, Serialize, Default, Debug, Clone, PartialEq)]
pub(crate) struct Config {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub hub: HubSettings,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl Config {
    pub(crate) fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// Weights directory, `<storage root>/models` unless configured.
    pub(crate) fn models_dir(&self, storage_root: &Path) -> PathBuf {
        match &self.server.models_dir {
            Some(dir) => dir.clone(),
            None => storage_root.join("models"),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();

        for ProviderConfig { name, provider } in &self.providers {
            if name.trim().is_empty() {
                return Err(ConfigError::EmptyProviderName);
            }

            if !seen.insert(name.as_str()) {
                return Err(ConfigError::DuplicateProvider(name.clone()));
            }

            match provider {
                Provider::RemoteListing(remote) => {
                    let url = url::Url::parse(&remote.api_base).map_err(|e| {
                        ConfigError::InvalidApiBase {
                            name: name.clone(),
                            reason: e.to_string(),
                        }
                    })?;

                    if !matches!(url.scheme(), "http" | "https") {
                        return Err(ConfigError::InvalidApiBase {
                            name: name.clone(),
                            reason: format!("unsupported scheme \"{}\"", url.scheme()),
                        });
                    }
                }
                Provider::LocalQuantized(local) => {
                    if local.binary_path.trim().is_empty() {
                        return Err(ConfigError::EmptyBinaryPath(name.clone()));
                    }
                }
            }
        }

        if url::Url::parse(&self.hub.endpoint).is_err() {
            return Err(ConfigError::InvalidHubEndpoint(self.hub.endpoint.clone()));
        }

        Ok(())
    }
}

/// Picks the storage root: `$MODELGATE_HOME`, then `$XDG_CONFIG_HOME/modelgate`,
/// then `~/.config/modelgate`.
pub(crate) fn default_storage_root() -> Option<PathBuf> {
    if let Some(home) = std::env::var_os("MODELGATE_HOME") {
        return Some(PathBuf::from(home));
    }

    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg).join("modelgate"));
    }

    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config/modelgate"))
}

pub(crate) fn parse_config(raw_config: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::de::from_str(raw_config)?;

    config.validate()?;

    Ok(config)
}

/// Creates the storage root and a default configuration if either is missing.
pub(crate) fn ensure_config(storage_root: &Path) -> Result<PathBuf, ConfigError> {
    std::fs::create_dir_all(storage_root).map_err(|source| ConfigError::Create {
        path: storage_root.to_path_buf(),
        source,
    })?;

    let path = storage_root.join(CONFIG_FILE_NAME);

    let created = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path);

    match created {
        Ok(mut file) => {
            file.write_all(DEFAULT_CONFIG.as_bytes())
                .map_err(|source| ConfigError::Create {
                    path: path.clone(),
                    source,
                })?;

            tracing::info!(path = %path.display(), "created default configuration");
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(source) => return Err(ConfigError::Create { path, source }),
    }

    Ok(path)
}

/// Reads the configuration under `storage_root`. A missing file is the empty
/// default.
pub(crate) async fn load_config(storage_root: &Path) -> Result<Config, ConfigError> {
    let path = storage_root.join(CONFIG_FILE_NAME);

    match tokio::fs::read_to_string(&path).await {
        Ok(raw_config) => parse_config(&raw_config),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
        Err(source) => Err(ConfigError::Read { path, source }),
    }
}

fn extraneous_keys_helper<'a>(
    path: &mut Vec<String>,
    user_value: &'a toml::Value,
    config_value: &'a toml::Value,
    found: &mut Vec<String>,
) {
    match (user_value, config_value) {
        (toml::Value::Table(user_table), toml::Value::Table(config_table)) => {
            for (user_key, user_value) in user_table {
                path.push(user_key.clone());

                match config_table.get(user_key) {
                    Some(config_value) => {
                        extraneous_keys_helper(path, user_value, config_value, found)
                    }
                    None => found.push(path.join(".")),
                }

                path.pop();
            }
        }
        (toml::Value::Array(user_items), toml::Value::Array(config_items)) => {
            for (i, (user_item, config_item)) in user_items.iter().zip(config_items).enumerate() {
                path.push(i.to_string());

                extraneous_keys_helper(path, user_item, config_item, found);

                path.pop();
            }
        }
        _ => {}
    }
}

/// Lists the dotted paths of keys present in the user's file that do not
/// survive a deserialize/serialize round trip, i.e. keys that are ignored.
pub(crate) fn extraneous_keys(config: &Config, raw_config: &str) -> Vec<String> {
    let user_config: toml::Value = match toml::de::from_str(raw_config) {
        Ok(value) => value,
        Err(_) => return Vec::new(),
    };

    let config: toml::Value = match toml::Value::try_from(config) {
        Ok(value) => value,
        Err(_) => return Vec::new(),
    };

    let mut found = Vec::new();

    extraneous_keys_helper(&mut Vec::new(), &user_config, &config, &mut found);

    found
}

/// Loads the configuration for a command line invocation, creating a default
/// one when absent and warning about ignored keys.
pub(crate) fn read_config(storage_root: &Path) -> Result<Config, ConfigError> {
    let path = ensure_config(storage_root)?;

    let raw_config = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;

    let config = parse_config(&raw_config)?;

    for key in extraneous_keys(&config, &raw_config) {
        warn!("config contains extraneous key \"{}\", ignoring", key);
    }

    Ok(config)
}
