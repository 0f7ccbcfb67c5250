//! Configuration schema and multi-format loader.
//!
//! Grounded on the teacher's `config` crate: `${VAR}` environment
//! substitution applied to the raw file text before parsing, and a
//! project-local-then-user-global discovery order.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const CONFIG_FILENAMES: &[&str] = &["gateway.toml", "gateway.yaml", "gateway.yml", "gateway.json"];

/// Per-channel configuration block: `{enabled, name, icon, config:map}`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
}

/// WebSocket realtime channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub max_connections: usize,
    pub ping_interval_seconds: u64,
    pub allowed_origins: Vec<String>,
    pub token: Option<String>,
    pub dev_mode: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            ping_interval_seconds: 30,
            allowed_origins: Vec::new(),
            token: None,
            dev_mode: false,
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub enabled_channels: Vec<String>,
    pub channels: HashMap<String, ChannelConfig>,
    pub realtime: RealtimeConfig,
    /// Idle-eviction TTL in seconds for `ChannelContextManager` sessions.
    pub session_idle_ttl_seconds: Option<u64>,
}

/// Replace `${ENV_VAR}` placeholders in config string values.
///
/// Unresolvable variables are left as-is.
pub fn substitute_env(input: &str) -> String {
    substitute_env_with(input, |name| std::env::var(name).ok())
}

fn substitute_env_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                var_name.push(c);
            }
            if closed && !var_name.is_empty() {
                match lookup(&var_name) {
                    Some(val) => result.push_str(&val),
                    None => {
                        result.push_str("${");
                        result.push_str(&var_name);
                        result.push('}');
                    },
                }
            } else {
                result.push_str("${");
                result.push_str(&var_name);
            }
        } else {
            result.push(ch);
        }
    }

    result
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<GatewayConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

/// Load config from an explicit path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<GatewayConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    if let Some(dirs) = directories::ProjectDirs::from("", "", "relaygate") {
        let config_dir = dirs.config_dir();
        for name in CONFIG_FILENAMES {
            let p = config_dir.join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }

    None
}

/// Discover and load config from standard locations.
///
/// Search order: `./gateway.{toml,yaml,yml,json}`, then
/// `<user-config-dir>/relaygate/gateway.{toml,yaml,yml,json}`. Returns
/// `GatewayConfig::default()` if no config file is found or loading fails.
pub fn discover_and_load() -> GatewayConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    GatewayConfig::default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_var() {
        let lookup = |name: &str| match name {
            "RELAYGATE_TEST_VAR" => Some("hello".to_string()),
            _ => None,
        };
        assert_eq!(
            substitute_env_with("key=${RELAYGATE_TEST_VAR}", lookup),
            "key=hello"
        );
    }

    #[test]
    fn leaves_unknown_var() {
        let lookup = |_: &str| None;
        assert_eq!(
            substitute_env_with("${RELAYGATE_NONEXISTENT_XYZ}", lookup),
            "${RELAYGATE_NONEXISTENT_XYZ}"
        );
    }

    #[test]
    fn parses_toml_with_channels() {
        let raw = r#"
            enabled_channels = ["realtime"]

            [realtime]
            max_connections = 50
            ping_interval_seconds = 15

            [channels.realtime]
            enabled = true
        "#;
        let cfg: GatewayConfig = toml::from_str(raw).expect("parse");
        assert_eq!(cfg.enabled_channels, vec!["realtime".to_string()]);
        assert_eq!(cfg.realtime.max_connections, 50);
        assert!(cfg.channels["realtime"].enabled);
    }

    #[test]
    fn default_realtime_config_matches_spec() {
        let cfg = RealtimeConfig::default();
        assert_eq!(cfg.max_connections, 100);
        assert_eq!(cfg.ping_interval_seconds, 30);
    }
}
