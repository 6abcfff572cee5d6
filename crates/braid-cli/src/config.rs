//! Configuration file management for braid.
//!
//! TOML config at `~/.config/braid/config.toml` with a resolution chain:
//! CLI flag > env var > config file > default.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use braid_core::EngineConfig;
use braid_store::AutonomyMode;

/// On-disk config file shape.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// Where the document store persists.
    pub data_dir: Option<PathBuf>,
    /// Where strand workspaces live; enables git features when set.
    pub workspaces_dir: Option<PathBuf>,
    /// Default PM session key.
    pub pm_session: Option<String>,
    /// Role -> agent id map.
    pub agent_roles: BTreeMap<String, String>,
    /// Model override for spawned workers.
    pub default_model: Option<String>,
    /// `plan` or `full`.
    pub default_autonomy: Option<String>,
    /// PM chat history cap.
    pub max_history: Option<usize>,
}

/// Return the braid config directory.
///
/// Always XDG layout: `$XDG_CONFIG_HOME/braid` or `~/.config/braid`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("braid");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("braid")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Load the config file; missing file yields defaults.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ConfigFile::default()),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read config at {}", path.display()));
        }
    };
    toml::from_str(&contents).context("failed to parse config file")
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    let path = config_path();
    std::fs::write(&path, contents)
        .with_context(|| format!("failed to write config at {}", path.display()))?;
    Ok(())
}

/// Build the engine config: CLI flags > env vars > config file > default.
pub fn resolve_engine_config(
    file: &ConfigFile,
    data_dir_flag: Option<PathBuf>,
    workspaces_dir_flag: Option<PathBuf>,
) -> Result<EngineConfig> {
    let data_dir = data_dir_flag
        .or_else(|| std::env::var("BRAID_DATA_DIR").ok().map(PathBuf::from))
        .or_else(|| file.data_dir.clone())
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local")
                .join("share")
                .join("braid")
        });

    let mut config = EngineConfig::new(data_dir);
    config.workspaces_dir = workspaces_dir_flag
        .or_else(|| std::env::var("BRAID_WORKSPACES_DIR").ok().map(PathBuf::from))
        .or_else(|| file.workspaces_dir.clone());
    config.pm_session = file.pm_session.clone();
    config.agent_roles = file.agent_roles.clone();
    config.default_model = file.default_model.clone();
    if let Some(autonomy) = &file.default_autonomy {
        config.default_autonomy = autonomy
            .parse::<AutonomyMode>()
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    if let Some(max) = file.max_history {
        config.max_history = max;
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_parses_to_defaults() {
        let parsed: ConfigFile = toml::from_str("").unwrap();
        assert!(parsed.data_dir.is_none());
        assert!(parsed.agent_roles.is_empty());
    }

    #[test]
    fn full_file_roundtrips() {
        let mut file = ConfigFile {
            data_dir: Some(PathBuf::from("/data")),
            workspaces_dir: Some(PathBuf::from("/ws")),
            pm_session: Some("agent:pm:webchat".into()),
            default_model: Some("big-model".into()),
            default_autonomy: Some("full".into()),
            max_history: Some(50),
            ..ConfigFile::default()
        };
        file.agent_roles.insert("backend".into(), "be-agent".into());

        let text = toml::to_string_pretty(&file).unwrap();
        let back: ConfigFile = toml::from_str(&text).unwrap();
        assert_eq!(back.data_dir, file.data_dir);
        assert_eq!(back.agent_roles.get("backend").map(String::as_str), Some("be-agent"));
    }

    #[test]
    fn resolve_applies_flag_over_file() {
        let file = ConfigFile {
            data_dir: Some(PathBuf::from("/from-file")),
            ..ConfigFile::default()
        };
        let config =
            resolve_engine_config(&file, Some(PathBuf::from("/from-flag")), None).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/from-flag"));
    }

    #[test]
    fn resolve_parses_autonomy() {
        let file = ConfigFile {
            default_autonomy: Some("full".into()),
            ..ConfigFile::default()
        };
        let config = resolve_engine_config(&file, Some(PathBuf::from("/d")), None).unwrap();
        assert_eq!(config.default_autonomy, AutonomyMode::Full);

        let bad = ConfigFile {
            default_autonomy: Some("yolo".into()),
            ..ConfigFile::default()
        };
        assert!(resolve_engine_config(&bad, Some(PathBuf::from("/d")), None).is_err());
    }
}
