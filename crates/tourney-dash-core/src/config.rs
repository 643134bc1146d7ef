// Configuration loading and parsing (relay.toml).

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

/// File name looked up in `config/` and in the per-user config directory.
pub const CONFIG_FILE_NAME: &str = "relay.toml";

/// Upper bound for `relay.idle_timeout_secs` (one day).
pub const MAX_IDLE_TIMEOUT_SECS: u64 = 24 * 60 * 60;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },
}

// ---------------------------------------------------------------------------
// Config structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

/// `[relay]` section: where the relay listens.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Path of the single WebSocket endpoint. Other paths are refused.
    pub path: String,
    /// Seconds without inbound traffic after which a connection is closed.
    pub idle_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            host: "localhost".into(),
            port: 7270,
            path: "/ws".into(),
            idle_timeout_secs: 30,
        }
    }
}

impl RelayConfig {
    /// Check the relay section on its own. `Relay::bind` calls this too, so a
    /// hand-built config gets the same checks as one loaded from a file.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::ValidationError {
                field: "relay.host".into(),
                message: "must not be empty".into(),
            });
        }

        if !self.path.starts_with('/') {
            return Err(ConfigError::ValidationError {
                field: "relay.path".into(),
                message: format!("must start with '/', got {:?}", self.path),
            });
        }

        if self.idle_timeout_secs == 0 || self.idle_timeout_secs > MAX_IDLE_TIMEOUT_SECS {
            return Err(ConfigError::ValidationError {
                field: "relay.idle_timeout_secs".into(),
                message: format!(
                    "must be between 1 and {MAX_IDLE_TIMEOUT_SECS}, got {}",
                    self.idle_timeout_secs
                ),
            });
        }

        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// `[agent]` section: how a client sync agent reaches the relay.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub url: String,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            url: "ws://localhost:7270/ws".into(),
            reconnect_initial_ms: 500,
            reconnect_max_ms: 10_000,
        }
    }
}

impl AgentConfig {
    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate a single config file.
pub fn load_config_file(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;
    let config: Config = toml::from_str(&text).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        source: e,
    })?;
    validate(&config)?;
    Ok(config)
}

/// Candidate config files, in lookup order: `config/relay.toml` under
/// `base_dir`, then the per-user config directory.
pub fn config_search_paths(base_dir: &Path) -> Vec<PathBuf> {
    let mut paths = vec![base_dir.join("config").join(CONFIG_FILE_NAME)];
    if let Some(dirs) = ProjectDirs::from("", "", "tourney-dash") {
        paths.push(dirs.config_dir().join(CONFIG_FILE_NAME));
    }
    paths
}

/// Load the first existing config file under `base_dir`'s search paths, or
/// the compiled-in defaults when none exists.
pub(crate) fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    for path in config_search_paths(base_dir) {
        if path.is_file() {
            info!("Loading configuration from {}", path.display());
            return load_config_file(&path);
        }
        debug!("No config file at {}", path.display());
    }

    info!("No config file found, using defaults");
    let config = Config::default();
    validate(&config)?;
    Ok(config)
}

/// Convenience wrapper: loads config relative to the current working directory.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    load_config_from(&cwd)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    config.relay.validate()?;

    let agent = &config.agent;
    if !(agent.url.starts_with("ws://") || agent.url.starts_with("wss://")) {
        return Err(ConfigError::ValidationError {
            field: "agent.url".into(),
            message: format!("must be a ws:// or wss:// URL, got {:?}", agent.url),
        });
    }

    if agent.reconnect_initial_ms == 0 {
        return Err(ConfigError::ValidationError {
            field: "agent.reconnect_initial_ms".into(),
            message: "must be greater than 0".into(),
        });
    }

    if agent.reconnect_initial_ms > agent.reconnect_max_ms {
        return Err(ConfigError::ValidationError {
            field: "agent.reconnect_max_ms".into(),
            message: format!(
                "must be at least reconnect_initial_ms ({}), got {}",
                agent.reconnect_initial_ms, agent.reconnect_max_ms
            ),
        });
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    /// Helper: fresh temp dir with a `config/` subdirectory.
    fn temp_base(name: &str) -> PathBuf {
        let tmp = std::env::temp_dir().join(name);
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(tmp.join("config")).unwrap();
        tmp
    }

    fn write_config(base: &Path, text: &str) -> PathBuf {
        let path = base.join("config").join(CONFIG_FILE_NAME);
        fs::write(&path, text).unwrap();
        path
    }

    fn validation_field(result: Result<Config, ConfigError>) -> String {
        match result {
            Err(ConfigError::ValidationError { field, .. }) => field,
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }

    #[test]
    fn defaults_match_well_known_endpoint() {
        let config = Config::default();
        assert_eq!(config.relay.host, "localhost");
        assert_eq!(config.relay.port, 7270);
        assert_eq!(config.relay.path, "/ws");
        assert_eq!(config.relay.idle_timeout(), Duration::from_secs(30));
        assert_eq!(config.relay.bind_addr(), "localhost:7270");
        assert_eq!(config.agent.url, "ws://localhost:7270/ws");
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn full_file_is_loaded() {
        let base = temp_base("tourney_dash_config_full");
        let path = write_config(
            &base,
            r#"
[relay]
host = "0.0.0.0"
port = 9000
path = "/sync"
idle_timeout_secs = 60

[agent]
url = "ws://10.0.0.2:9000/sync"
reconnect_initial_ms = 250
reconnect_max_ms = 4000
"#,
        );

        let config = load_config_file(&path).expect("should load full config");
        assert_eq!(config.relay.host, "0.0.0.0");
        assert_eq!(config.relay.port, 9000);
        assert_eq!(config.relay.path, "/sync");
        assert_eq!(config.relay.idle_timeout_secs, 60);
        assert_eq!(config.agent.url, "ws://10.0.0.2:9000/sync");
        assert_eq!(config.agent.reconnect_initial(), Duration::from_millis(250));
        assert_eq!(config.agent.reconnect_max(), Duration::from_millis(4000));

        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let base = temp_base("tourney_dash_config_partial");
        let path = write_config(&base, "[relay]\nport = 8123\n");

        let config = load_config_file(&path).expect("should load partial config");
        assert_eq!(config.relay.port, 8123);
        assert_eq!(config.relay.host, "localhost");
        assert_eq!(config.relay.path, "/ws");
        assert_eq!(config.agent.reconnect_max_ms, 10_000);

        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn load_from_dir_prefers_local_file() {
        let base = temp_base("tourney_dash_config_local");
        write_config(&base, "[relay]\nport = 7999\n");

        let config = load_config_from(&base).unwrap();
        assert_eq!(config.relay.port, 7999);

        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn search_paths_start_with_local_config_dir() {
        let base = PathBuf::from("/srv/overlay");
        let paths = config_search_paths(&base);
        assert_eq!(paths[0], base.join("config").join("relay.toml"));
    }

    #[test]
    fn malformed_toml_reports_path() {
        let base = temp_base("tourney_dash_config_malformed");
        let path = write_config(&base, "[relay\nport = ");

        match load_config_file(&path) {
            Err(ConfigError::ParseError { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected ParseError, got {other:?}"),
        }

        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn wrong_type_is_a_parse_error() {
        let base = temp_base("tourney_dash_config_wrong_type");
        let path = write_config(&base, "[relay]\nport = \"seventy\"\n");

        assert!(matches!(
            load_config_file(&path),
            Err(ConfigError::ParseError { .. })
        ));

        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let path = std::env::temp_dir().join("tourney_dash_no_such_dir/relay.toml");
        assert!(matches!(
            load_config_file(&path),
            Err(ConfigError::ReadError { .. })
        ));
    }

    #[test]
    fn rejects_path_without_leading_slash() {
        let base = temp_base("tourney_dash_config_bad_path");
        let path = write_config(&base, "[relay]\npath = \"ws\"\n");
        assert_eq!(validation_field(load_config_file(&path)), "relay.path");
        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn rejects_zero_idle_timeout() {
        let base = temp_base("tourney_dash_config_zero_idle");
        let path = write_config(&base, "[relay]\nidle_timeout_secs = 0\n");
        assert_eq!(
            validation_field(load_config_file(&path)),
            "relay.idle_timeout_secs"
        );
        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn rejects_idle_timeout_above_one_day() {
        let base = temp_base("tourney_dash_config_huge_idle");
        let path = write_config(&base, "[relay]\nidle_timeout_secs = 9223372036854775807\n");
        assert_eq!(
            validation_field(load_config_file(&path)),
            "relay.idle_timeout_secs"
        );

        let path = write_config(&base, &format!("[relay]\nidle_timeout_secs = {MAX_IDLE_TIMEOUT_SECS}\n"));
        assert!(load_config_file(&path).is_ok());
        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn relay_section_validates_on_its_own() {
        let mut relay = RelayConfig::default();
        assert!(relay.validate().is_ok());

        relay.idle_timeout_secs = 0;
        assert!(matches!(
            relay.validate(),
            Err(ConfigError::ValidationError { field, .. }) if field == "relay.idle_timeout_secs"
        ));
    }

    #[test]
    fn rejects_empty_host() {
        let base = temp_base("tourney_dash_config_empty_host");
        let path = write_config(&base, "[relay]\nhost = \"  \"\n");
        assert_eq!(validation_field(load_config_file(&path)), "relay.host");
        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn rejects_http_agent_url() {
        let base = temp_base("tourney_dash_config_http_url");
        let path = write_config(&base, "[agent]\nurl = \"http://localhost:7270/ws\"\n");
        assert_eq!(validation_field(load_config_file(&path)), "agent.url");
        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn rejects_inverted_backoff_bounds() {
        let base = temp_base("tourney_dash_config_backoff");
        let path = write_config(
            &base,
            "[agent]\nreconnect_initial_ms = 5000\nreconnect_max_ms = 1000\n",
        );
        assert_eq!(
            validation_field(load_config_file(&path)),
            "agent.reconnect_max_ms"
        );
        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn rejects_zero_initial_backoff() {
        let base = temp_base("tourney_dash_config_zero_backoff");
        let path = write_config(&base, "[agent]\nreconnect_initial_ms = 0\n");
        assert_eq!(
            validation_field(load_config_file(&path)),
            "agent.reconnect_initial_ms"
        );
        let _ = fs::remove_dir_all(&base);
    }
}
