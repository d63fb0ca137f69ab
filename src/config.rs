use crate::error::SyncError;
use crate::transport::Backoff;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://{app}.devsync.dev/{env}/graphql";

/// Contents of `config.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// GraphQL endpoint; `{app}` and `{env}` are substituted
    pub api_url: Option<String>,
    pub token: Option<String>,
    pub debounce_ms: Option<u64>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    pub base_ms: Option<u64>,
    pub cap_ms: Option<u64>,
    pub jitter_ms: Option<u64>,
    pub max_attempts: Option<u32>,
}

/// Named defaults for the global flags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    pub app: Option<String>,
    pub env: Option<String>,
    pub dir: Option<PathBuf>,
}

impl Config {
    /// Config file location: `$DEVSYNC_CONFIG`, else `<config dir>/devsync/config.toml`
    pub fn config_path() -> Result<PathBuf> {
        if let Some(path) = std::env::var_os("DEVSYNC_CONFIG") {
            return Ok(PathBuf::from(path));
        }
        let dir = dirs::config_dir().context("Could not determine the config directory")?;
        Ok(dir.join("devsync").join("config.toml"))
    }

    /// Load the config file (missing is fine) and apply environment overrides
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = Self::load_from(&path)?;
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config file at {}", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("DEVSYNC_API_URL").filter(|v| !v.is_empty()) {
            self.api_url = Some(url);
        }
        if let Some(token) = var("DEVSYNC_TOKEN").filter(|v| !v.is_empty()) {
            self.token = Some(token);
        }
    }

    pub fn list_profiles(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }

    pub fn get_profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    /// Profile rendered back as TOML, for `--show-profile`
    pub fn show_profile(&self, name: &str) -> Option<String> {
        let profile = self.get_profile(name)?;
        let body = toml::to_string(profile).ok()?;
        Some(format!("[profiles.{}]\n{}", name, body))
    }

    /// Endpoint for `app` in `env`
    pub fn api_url(&self, app: &str, env: &str) -> String {
        self.api_url
            .as_deref()
            .unwrap_or(DEFAULT_API_URL)
            .replace("{app}", app)
            .replace("{env}", env)
    }

    pub fn debounce(&self) -> Duration {
        self.debounce_ms
            .map(Duration::from_millis)
            .unwrap_or(crate::sync::debounce::DEFAULT_DEBOUNCE)
    }

    pub fn backoff(&self) -> Backoff {
        let default = Backoff::default();
        Backoff {
            base: self.retry.base_ms.map(Duration::from_millis).unwrap_or(default.base),
            cap: self.retry.cap_ms.map(Duration::from_millis).unwrap_or(default.cap),
            jitter: self
                .retry
                .jitter_ms
                .map(Duration::from_millis)
                .unwrap_or(default.jitter),
            max_attempts: self.retry.max_attempts.unwrap_or(default.max_attempts),
        }
    }
}

/// Collapse a config failure into the library error type
pub fn to_sync_error(e: anyhow::Error) -> SyncError {
    SyncError::Config(format!("{:#}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
api_url = "http://localhost:4000/{app}/{env}/graphql"
token = "secret"
debounce_ms = 150

[retry]
base_ms = 50
max_attempts = 3

[profiles.web]
app = "shop"
env = "staging"
dir = "/work/shop"
"#;

    #[test]
    fn test_parse_full_config() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.token.as_deref(), Some("secret"));
        assert_eq!(config.debounce(), Duration::from_millis(150));
        assert_eq!(
            config.api_url("shop", "staging"),
            "http://localhost:4000/shop/staging/graphql"
        );

        let backoff = config.backoff();
        assert_eq!(backoff.base, Duration::from_millis(50));
        assert_eq!(backoff.cap, Backoff::default().cap);
        assert_eq!(backoff.max_attempts, 3);

        let profile = config.get_profile("web").unwrap();
        assert_eq!(profile.app.as_deref(), Some("shop"));
        assert_eq!(profile.dir.as_deref(), Some(Path::new("/work/shop")));
        assert_eq!(config.list_profiles(), vec!["web"]);
    }

    #[test]
    fn test_defaults_when_missing() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("config.toml")).unwrap();
        assert!(config.token.is_none());
        assert_eq!(config.debounce(), Duration::from_millis(300));
        assert_eq!(config.backoff(), Backoff::default());
        assert_eq!(
            config.api_url("a", "b"),
            "https://a.devsync.dev/b/graphql"
        );
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let err = Config::parse("colour = \"blue\"").unwrap_err();
        assert!(err.to_string().contains("colour"));
    }

    #[test]
    fn test_invalid_file_names_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "debounce_ms = \"soon\"").unwrap();

        let err = to_sync_error(Config::load_from(&path).unwrap_err());
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::parse(SAMPLE).unwrap();
        config.apply_env(|name| match name {
            "DEVSYNC_TOKEN" => Some("from-env".to_string()),
            "DEVSYNC_API_URL" => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.token.as_deref(), Some("from-env"));
        // Empty values do not override
        assert!(config.api_url.as_deref().unwrap().starts_with("http://localhost"));
    }

    #[test]
    fn test_show_profile() {
        let config = Config::parse(SAMPLE).unwrap();
        let shown = config.show_profile("web").unwrap();
        assert!(shown.starts_with("[profiles.web]"));
        assert!(shown.contains("app = \"shop\""));
        assert!(config.show_profile("missing").is_none());
    }
}
