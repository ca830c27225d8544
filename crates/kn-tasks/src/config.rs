use std::{fmt, io, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;

const CLIENT_CONFIG_FILE: &str = "client-config.json";

/// Which call convention the bridge uses for this session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeMode {
    /// Native when a host is attached, loopback otherwise.
    #[default]
    Auto,
    Native,
    Loopback,
}

impl FromStr for BridgeMode {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(BridgeMode::Auto),
            "native" => Ok(BridgeMode::Native),
            "loopback" | "local" => Ok(BridgeMode::Loopback),
            other => Err(ConfigError::InvalidValue {
                key: "bridge",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for BridgeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BridgeMode::Auto => "auto",
            BridgeMode::Native => "native",
            BridgeMode::Loopback => "loopback",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub bridge: BridgeMode,
    /// Maximum log entries kept per task. `None` or `0` keeps everything.
    pub task_log_limit: Option<usize>,
}

impl ClientConfig {
    /// Effective per-task log cap, with `0` read as unbounded wherever it came from.
    pub fn log_limit(&self) -> Option<usize> {
        self.task_log_limit.filter(|limit| *limit > 0)
    }

    /// Reads the state file, then lets `KN_BRIDGE` / `KN_TASK_LOG_LIMIT` win.
    pub fn load() -> Self {
        let path = client_config_path();
        let mut cfg = match std::fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str::<ClientConfig>(&data) {
                Ok(cfg) => cfg,
                Err(err) => {
                    warn!("Failed to parse {}: {err}", path.display());
                    ClientConfig::default()
                }
            },
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to read {}: {err}", path.display());
                }
                ClientConfig::default()
            }
        };
        if let Err(err) = cfg.apply_env(|key| std::env::var(key).ok()) {
            warn!("Ignoring environment override: {err}");
        }
        cfg
    }

    pub fn save(&self) -> io::Result<()> {
        kn_util::write_json_atomic(&client_config_path(), self)
    }

    pub(crate) fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("KN_BRIDGE") {
            self.bridge = raw.parse()?;
        }
        if let Some(raw) = lookup("KN_TASK_LOG_LIMIT") {
            let trimmed = raw.trim();
            self.task_log_limit = if trimmed.is_empty() || trimmed == "0" {
                None
            } else {
                Some(trimmed.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "task_log_limit",
                    value: trimmed.to_string(),
                })?)
            };
        }
        Ok(())
    }
}

fn client_config_path() -> PathBuf {
    kn_util::state_file_path(CLIENT_CONFIG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_auto_and_unbounded() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.bridge, BridgeMode::Auto);
        assert_eq!(cfg.task_log_limit, None);
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let cfg: ClientConfig = serde_json::from_str(r#"{"bridge":"native"}"#).unwrap();
        assert_eq!(cfg.bridge, BridgeMode::Native);
        assert_eq!(cfg.task_log_limit, None);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut cfg = ClientConfig {
            bridge: BridgeMode::Native,
            task_log_limit: Some(10),
        };
        cfg.apply_env(env(&[("KN_BRIDGE", "Loopback"), ("KN_TASK_LOG_LIMIT", "0")]))
            .unwrap();
        assert_eq!(cfg.bridge, BridgeMode::Loopback);
        assert_eq!(cfg.task_log_limit, None);

        cfg.apply_env(env(&[("KN_TASK_LOG_LIMIT", "500")])).unwrap();
        assert_eq!(cfg.task_log_limit, Some(500));
    }

    #[test]
    fn zero_limit_means_unbounded_from_file_or_env() {
        let from_file: ClientConfig = serde_json::from_str(r#"{"task_log_limit":0}"#).unwrap();
        assert_eq!(from_file.task_log_limit, Some(0));
        assert_eq!(from_file.log_limit(), None);

        let mut from_env = ClientConfig::default();
        from_env
            .apply_env(env(&[("KN_TASK_LOG_LIMIT", "0")]))
            .unwrap();
        assert_eq!(from_env.log_limit(), None);

        let capped: ClientConfig = serde_json::from_str(r#"{"task_log_limit":25}"#).unwrap();
        assert_eq!(capped.log_limit(), Some(25));
    }

    #[test]
    fn bad_env_values_are_reported() {
        let mut cfg = ClientConfig::default();
        assert!(cfg.apply_env(env(&[("KN_BRIDGE", "carrier-pigeon")])).is_err());
        assert!(cfg.apply_env(env(&[("KN_TASK_LOG_LIMIT", "lots")])).is_err());
        assert_eq!(cfg, ClientConfig::default());
    }
}
