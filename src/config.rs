//! Configuration resolution.
//!
//! Priority order, highest first:
//! 1. Command-line arguments
//! 2. `SCHOOLD_*` environment variables
//! 3. TOML config file (`--config`, or `./schoold.toml` when present)
//! 4. Compiled defaults

use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "schoold.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub bind: String,
    /// HMAC secret for bearer tokens. When unset a per-process secret is
    /// generated, so tokens do not survive a restart.
    pub token_secret: Option<String>,
    pub token_ttl_minutes: i64,
    pub admin_username: String,
    pub admin_password: String,
    pub cors_permissive: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./schoold-data"),
            bind: "127.0.0.1:5080".to_string(),
            token_secret: None,
            token_ttl_minutes: 12 * 60,
            admin_username: "admin".to_string(),
            admin_password: "admin123".to_string(),
            cors_permissive: true,
        }
    }
}

/// Values that come from the command line and win over everything else.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config_path: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub bind: Option<String>,
}

pub fn load(overrides: &Overrides) -> Result<Config, ConfigError> {
    let mut cfg = match overrides.config_path.as_deref() {
        Some(path) => read_file(path)?,
        None => {
            let fallback = Path::new(DEFAULT_CONFIG_FILE);
            if fallback.is_file() {
                read_file(fallback)?
            } else {
                Config::default()
            }
        }
    };
    apply_env(&mut cfg, |key| std::env::var(key).ok())?;
    if let Some(dir) = &overrides.data_dir {
        cfg.data_dir = dir.clone();
    }
    if let Some(bind) = &overrides.bind {
        cfg.bind = bind.clone();
    }
    validate(&cfg)?;
    Ok(cfg)
}

pub fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn apply_env<F>(cfg: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("SCHOOLD_DATA_DIR") {
        cfg.data_dir = PathBuf::from(v);
    }
    if let Some(v) = lookup("SCHOOLD_BIND") {
        cfg.bind = v;
    }
    if let Some(v) = lookup("SCHOOLD_TOKEN_SECRET") {
        cfg.token_secret = Some(v);
    }
    if let Some(v) = lookup("SCHOOLD_TOKEN_TTL_MINUTES") {
        cfg.token_ttl_minutes = v.trim().parse::<i64>().map_err(|_| {
            ConfigError::Invalid(format!("SCHOOLD_TOKEN_TTL_MINUTES is not an integer: {v}"))
        })?;
    }
    if let Some(v) = lookup("SCHOOLD_ADMIN_USERNAME") {
        cfg.admin_username = v;
    }
    if let Some(v) = lookup("SCHOOLD_ADMIN_PASSWORD") {
        cfg.admin_password = v;
    }
    if let Some(v) = lookup("SCHOOLD_CORS_PERMISSIVE") {
        cfg.cors_permissive = matches!(v.trim(), "1" | "true" | "yes");
    }
    Ok(())
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.token_ttl_minutes <= 0 {
        return Err(ConfigError::Invalid(
            "token_ttl_minutes must be positive".to_string(),
        ));
    }
    if cfg.admin_username.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "admin_username must not be empty".to_string(),
        ));
    }
    if cfg.admin_password.len() < 6 {
        return Err(ConfigError::Invalid(
            "admin_password must be at least 6 characters".to_string(),
        ));
    }
    if let Some(secret) = &cfg.token_secret {
        if secret.len() < 16 {
            return Err(ConfigError::Invalid(
                "token_secret must be at least 16 characters".to_string(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn toml_values_fill_gaps_with_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            data_dir = "/var/lib/schoold"
            token_ttl_minutes = 30
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/schoold"));
        assert_eq!(cfg.token_ttl_minutes, 30);
        assert_eq!(cfg.bind, Config::default().bind);
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("SCHOOLD_BIND", "0.0.0.0:9000"),
            ("SCHOOLD_TOKEN_TTL_MINUTES", "5"),
            ("SCHOOLD_CORS_PERMISSIVE", "false"),
        ]
        .into_iter()
        .collect();
        let mut cfg = Config::default();
        apply_env(&mut cfg, |k| env.get(k).map(|v| v.to_string())).expect("env");
        assert_eq!(cfg.bind, "0.0.0.0:9000");
        assert_eq!(cfg.token_ttl_minutes, 5);
        assert!(!cfg.cors_permissive);
    }

    #[test]
    fn bad_ttl_in_env_is_rejected() {
        let mut cfg = Config::default();
        let res = apply_env(&mut cfg, |k| {
            (k == "SCHOOLD_TOKEN_TTL_MINUTES").then(|| "soon".to_string())
        });
        assert!(matches!(res, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn short_secret_fails_validation() {
        let cfg = Config {
            token_secret: Some("short".to_string()),
            ..Config::default()
        };
        assert!(validate(&cfg).is_err());
    }
}
