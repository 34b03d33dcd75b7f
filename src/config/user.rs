//! Configuration file loading for tsunagi.
//!
//! Lookup order:
//! 1. An explicit path passed by the caller
//! 2. `$TSUNAGI_CONFIG`
//! 3. `<config_dir>/tsunagi/tsunagi.toml` (e.g. `~/.config/tsunagi/tsunagi.toml`)
//!
//! A missing file at the default location is not an error; defaults apply.

use std::path::{Path, PathBuf};

use thiserror::Error;

use super::BridgeSettings;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "TSUNAGI_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Returns the path configuration is read from when none is given explicitly.
pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = env_config_path() {
        return Some(path);
    }

    dirs::config_dir().map(|dir| dir.join("tsunagi").join("tsunagi.toml"))
}

fn env_config_path() -> Option<PathBuf> {
    std::env::var_os(CONFIG_ENV_VAR)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// Parse settings from TOML text.
pub fn parse_settings(text: &str) -> ConfigResult<BridgeSettings> {
    Ok(toml::from_str(text)?)
}

/// Load settings from `explicit`, or from the default location.
///
/// An explicit path, or one named by `$TSUNAGI_CONFIG`, must exist.
pub fn load_settings(explicit: Option<&Path>) -> ConfigResult<BridgeSettings> {
    let required = explicit.is_some() || env_config_path().is_some();
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match config_path() {
            Some(path) => path,
            None => return Ok(BridgeSettings::default()),
        },
    };

    match std::fs::read_to_string(&path) {
        Ok(text) => {
            log::debug!(
                target: "tsunagi::config",
                "Loaded configuration from {}",
                path.display()
            );
            parse_settings(&text)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
            Ok(BridgeSettings::default())
        }
        Err(source) => Err(ConfigError::Read { path, source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn with_config_env<T>(value: Option<&str>, f: impl FnOnce() -> T) -> T {
        let original = env::var(CONFIG_ENV_VAR).ok();
        // SAFETY: #[serial(config_env)] prevents concurrent modification of TSUNAGI_CONFIG
        unsafe {
            match value {
                Some(v) => env::set_var(CONFIG_ENV_VAR, v),
                None => env::remove_var(CONFIG_ENV_VAR),
            }
        }
        let result = f();
        // SAFETY: same as above, restoring original env state
        unsafe {
            match original {
                Some(v) => env::set_var(CONFIG_ENV_VAR, v),
                None => env::remove_var(CONFIG_ENV_VAR),
            }
        }
        result
    }

    #[test]
    fn empty_document_yields_defaults() {
        let settings = parse_settings("").unwrap();
        assert_eq!(settings, BridgeSettings::default());
    }

    #[test]
    fn worker_table_is_parsed() {
        let settings = parse_settings(
            r#"
            default_timeout_ms = 5000
            auto_restart = false
            max_pending_calls = 64

            [worker]
            command = "node"
            args = ["worker.js"]
            working_dir = "/srv/app"

            [worker.prepare]
            command = "npm"
            args = ["install"]
            "#,
        )
        .unwrap();

        assert_eq!(settings.default_timeout_ms, 5000);
        assert!(!settings.auto_restart);
        assert_eq!(settings.max_pending_calls, Some(64));
        let worker = settings.worker.expect("worker table");
        assert_eq!(worker.command, "node");
        assert_eq!(worker.args, vec!["worker.js"]);
        assert_eq!(worker.working_dir, Some(PathBuf::from("/srv/app")));
        assert_eq!(worker.prepare.unwrap().args, vec!["install"]);
    }

    #[test]
    fn unknown_value_type_is_rejected() {
        let result = parse_settings("default_timeout_ms = \"soon\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    #[serial(config_env)]
    fn env_var_overrides_default_location() {
        let path = with_config_env(Some("/custom/tsunagi.toml"), config_path);
        assert_eq!(path, Some(PathBuf::from("/custom/tsunagi.toml")));
    }

    #[test]
    #[serial(config_env)]
    fn explicit_path_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        std::fs::write(&path, "kill_grace_ms = 750\n").unwrap();

        let settings = with_config_env(None, || load_settings(Some(&path))).unwrap();
        assert_eq!(settings.kill_grace_ms, 750);
    }

    #[test]
    #[serial(config_env)]
    fn missing_explicit_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");

        let result = with_config_env(None, || load_settings(Some(&path)));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    #[serial(config_env)]
    fn missing_env_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");

        let result = with_config_env(path.to_str(), || load_settings(None));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
