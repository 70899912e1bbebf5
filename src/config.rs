use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

/// Runtime settings for the tracker, the store clients and the CLI.
#[derive(Deserialize, Debug, Clone)]
pub struct TrackerConfig {
    /// Project URL of the hosted store, e.g. `https://abc.supabase.co`.
    pub supabase_url: String,
    pub supabase_key: String,
    /// User session token sent as the bearer; falls back to the key.
    pub access_token: Option<String>,
    pub subscriptions_table: String,
    pub realtime_enabled: bool,
    pub tick_interval_ms: u64,
    pub poll_interval_secs: u64,
    pub refresh_max_attempts: u32,
    pub refresh_backoff_ms: u64,
    pub realtime_heartbeat_secs: u64,
    pub request_timeout_secs: u64,
    pub log_dir: String,
}

// Partial config for layering
#[derive(Deserialize, Default, Debug)]
struct PartialTrackerConfig {
    supabase_url: Option<String>,
    supabase_key: Option<String>,
    access_token: Option<String>,
    subscriptions_table: Option<String>,
    realtime_enabled: Option<bool>,
    tick_interval_ms: Option<u64>,
    poll_interval_secs: Option<u64>,
    refresh_max_attempts: Option<u32>,
    refresh_backoff_ms: Option<u64>,
    realtime_heartbeat_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
    log_dir: Option<String>,
}

const ENV_PREFIX: &str = "VIP_";

fn default_subscriptions_table() -> String {
    "vip_subscriptions".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

impl Default for TrackerConfig {
    /// Local settings with no remote store configured.
    fn default() -> Self {
        Self {
            supabase_url: String::new(),
            supabase_key: String::new(),
            access_token: None,
            subscriptions_table: default_subscriptions_table(),
            realtime_enabled: true,
            tick_interval_ms: 1000,
            poll_interval_secs: 30,
            refresh_max_attempts: 3,
            refresh_backoff_ms: 250,
            realtime_heartbeat_secs: 25,
            request_timeout_secs: 10,
            log_dir: default_log_dir(),
        }
    }
}

impl TrackerConfig {
    /// Loads `.env`, then the optional TOML file, then `VIP_*` environment
    /// variables. Environment overrides file.
    pub fn load(config_path: Option<&str>) -> Result<Self, String> {
        dotenv::dotenv().ok();
        let env_config: PartialTrackerConfig = envy::prefixed(ENV_PREFIX)
            .from_env()
            .map_err(|e| format!("Failed to load config from environment: {e}"))?;
        Self::load_layers(config_path, env_config)
    }

    /// Same layering as [`TrackerConfig::load`] with the environment supplied
    /// as key/value pairs (keys carry the `VIP_` prefix).
    pub fn load_from_vars<I>(config_path: Option<&str>, vars: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let env_config: PartialTrackerConfig = envy::prefixed(ENV_PREFIX)
            .from_iter(vars)
            .map_err(|e| format!("Failed to load config from environment: {e}"))?;
        Self::load_layers(config_path, env_config)
    }

    fn load_layers(
        config_path: Option<&str>,
        env_config: PartialTrackerConfig,
    ) -> Result<Self, String> {
        let file_config = match config_path {
            Some(path_str) => read_partial(Path::new(path_str))?,
            None => PartialTrackerConfig::default(),
        };

        let defaults = TrackerConfig::default();
        let config = TrackerConfig {
            supabase_url: env_config
                .supabase_url
                .or(file_config.supabase_url)
                .map(|url| url.trim_end_matches('/').to_string())
                .ok_or("VIP_SUPABASE_URL is required")?,
            supabase_key: env_config
                .supabase_key
                .or(file_config.supabase_key)
                .ok_or("VIP_SUPABASE_KEY is required")?,
            access_token: env_config.access_token.or(file_config.access_token),
            subscriptions_table: env_config
                .subscriptions_table
                .or(file_config.subscriptions_table)
                .unwrap_or(defaults.subscriptions_table),
            realtime_enabled: env_config
                .realtime_enabled
                .or(file_config.realtime_enabled)
                .unwrap_or(defaults.realtime_enabled),
            tick_interval_ms: env_config
                .tick_interval_ms
                .or(file_config.tick_interval_ms)
                .unwrap_or(defaults.tick_interval_ms),
            poll_interval_secs: env_config
                .poll_interval_secs
                .or(file_config.poll_interval_secs)
                .unwrap_or(defaults.poll_interval_secs),
            refresh_max_attempts: env_config
                .refresh_max_attempts
                .or(file_config.refresh_max_attempts)
                .unwrap_or(defaults.refresh_max_attempts),
            refresh_backoff_ms: env_config
                .refresh_backoff_ms
                .or(file_config.refresh_backoff_ms)
                .unwrap_or(defaults.refresh_backoff_ms),
            realtime_heartbeat_secs: env_config
                .realtime_heartbeat_secs
                .or(file_config.realtime_heartbeat_secs)
                .unwrap_or(defaults.realtime_heartbeat_secs),
            request_timeout_secs: env_config
                .request_timeout_secs
                .or(file_config.request_timeout_secs)
                .unwrap_or(defaults.request_timeout_secs),
            log_dir: env_config
                .log_dir
                .or(file_config.log_dir)
                .unwrap_or(defaults.log_dir),
        };

        config.validate()?;
        info!(
            supabase_url = %config.supabase_url,
            table = %config.subscriptions_table,
            realtime = config.realtime_enabled,
            "Loaded tracker configuration."
        );
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if !self.supabase_url.starts_with("http://") && !self.supabase_url.starts_with("https://") {
            return Err(format!(
                "supabase_url must be an http(s) URL, got '{}'",
                self.supabase_url
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err("tick_interval_ms must be greater than zero".to_string());
        }
        if self.poll_interval_secs == 0 {
            return Err("poll_interval_secs must be greater than zero".to_string());
        }
        if self.refresh_max_attempts == 0 {
            return Err("refresh_max_attempts must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn bearer_token(&self) -> &str {
        self.access_token.as_deref().unwrap_or(&self.supabase_key)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn refresh_backoff(&self) -> Duration {
        Duration::from_millis(self.refresh_backoff_ms)
    }

    pub fn realtime_heartbeat(&self) -> Duration {
        Duration::from_secs(self.realtime_heartbeat_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// `wss://<host>/realtime/v1/websocket?apikey=<key>&vsn=1.0.0`
    pub fn realtime_url(&self) -> String {
        let ws_base = if let Some(rest) = self.supabase_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.supabase_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.supabase_url.clone()
        };
        format!(
            "{ws_base}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            urlencoding::encode(&self.supabase_key)
        )
    }
}

fn read_partial(path: &Path) -> Result<PartialTrackerConfig, String> {
    if !path.exists() {
        warn!(path = ?path, "Config file not found; using environment and defaults.");
        return Ok(PartialTrackerConfig::default());
    }
    let contents = fs::read_to_string(path).map_err(|e| {
        error!(path = ?path, error = %e, "Failed to read tracker config file.");
        format!("Failed to read config file at {path:?}: {e}")
    })?;
    toml::from_str(&contents).map_err(|e| {
        error!(path = ?path, error = %e, "Failed to parse tracker config file.");
        format!("Failed to parse TOML from config file at {path:?}: {e}")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_env_only_uses_defaults() {
        let config = TrackerConfig::load_from_vars(
            None,
            vars(&[
                ("VIP_SUPABASE_URL", "https://abc.supabase.co/"),
                ("VIP_SUPABASE_KEY", "anon"),
            ]),
        )
        .unwrap();
        assert_eq!(config.supabase_url, "https://abc.supabase.co");
        assert_eq!(config.subscriptions_table, "vip_subscriptions");
        assert_eq!(config.tick_interval_ms, 1000);
        assert_eq!(config.bearer_token(), "anon");
    }

    #[test]
    fn test_env_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
supabase_url = "https://file.supabase.co"
supabase_key = "file-key"
poll_interval_secs = 60
access_token = "user-jwt"
"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = TrackerConfig::load_from_vars(
            Some(&path),
            vars(&[("VIP_POLL_INTERVAL_SECS", "5")]),
        )
        .unwrap();
        assert_eq!(config.supabase_url, "https://file.supabase.co");
        assert_eq!(config.poll_interval_secs, 5);
        assert_eq!(config.bearer_token(), "user-jwt");
    }

    #[test]
    fn test_missing_key_is_reported() {
        let err = TrackerConfig::load_from_vars(
            None,
            vars(&[("VIP_SUPABASE_URL", "https://abc.supabase.co")]),
        )
        .unwrap_err();
        assert!(err.contains("VIP_SUPABASE_KEY"));
    }

    #[test]
    fn test_missing_config_file_falls_back_to_env() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let config = TrackerConfig::load_from_vars(
            missing.to_str(),
            vars(&[
                ("VIP_SUPABASE_URL", "https://abc.supabase.co"),
                ("VIP_SUPABASE_KEY", "anon"),
            ]),
        )
        .unwrap();
        assert_eq!(config.supabase_key, "anon");
        assert_eq!(config.poll_interval_secs, 30);
    }

    #[test]
    fn test_invalid_toml_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "supabase_url = ").unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let err = TrackerConfig::load_from_vars(Some(&path), Vec::new()).unwrap_err();
        assert!(err.contains("Failed to parse TOML"));
    }

    #[test]
    fn test_zero_tick_interval_rejected() {
        let err = TrackerConfig::load_from_vars(
            None,
            vars(&[
                ("VIP_SUPABASE_URL", "https://abc.supabase.co"),
                ("VIP_SUPABASE_KEY", "anon"),
                ("VIP_TICK_INTERVAL_MS", "0"),
            ]),
        )
        .unwrap_err();
        assert!(err.contains("tick_interval_ms"));
    }

    #[test]
    fn test_realtime_url_from_https() {
        let config = TrackerConfig {
            supabase_url: "https://abc.supabase.co".to_string(),
            supabase_key: "an on".to_string(),
            ..TrackerConfig::default()
        };
        assert_eq!(
            config.realtime_url(),
            "wss://abc.supabase.co/realtime/v1/websocket?apikey=an%20on&vsn=1.0.0"
        );
    }
}
