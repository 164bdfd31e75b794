use std::path::PathBuf;

use anyhow::Context;
use rusqlite::Connection;
use serde::Deserialize;

use crate::auth::{RevocationList, TokenIssuer};
use crate::config::Config;
use crate::db;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Bearer token. HTTP callers pass it in the Authorization header and the
    /// front end copies it here.
    #[serde(default)]
    pub token: Option<String>,
}

impl Request {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
            token: None,
        }
    }
}

pub struct AppState {
    pub data_dir: PathBuf,
    pub db: Connection,
    pub tokens: TokenIssuer,
    pub revoked: RevocationList,
}

impl AppState {
    pub fn open(cfg: &Config) -> anyhow::Result<Self> {
        let conn = db::open_db(&cfg.data_dir).with_context(|| {
            format!("failed to open database in {}", cfg.data_dir.to_string_lossy())
        })?;
        if db::ensure_bootstrap_admin(&conn, &cfg.admin_username, &cfg.admin_password)? {
            tracing::info!(username = %cfg.admin_username, "created bootstrap admin account");
        }
        Ok(Self {
            data_dir: cfg.data_dir.clone(),
            db: conn,
            tokens: token_issuer(cfg),
            revoked: RevocationList::default(),
        })
    }

    /// State over an in-memory database. Backups still go to `data_dir`.
    pub fn in_memory(cfg: &Config) -> anyhow::Result<Self> {
        let conn = db::open_in_memory()?;
        db::ensure_bootstrap_admin(&conn, &cfg.admin_username, &cfg.admin_password)?;
        Ok(Self {
            data_dir: cfg.data_dir.clone(),
            db: conn,
            tokens: token_issuer(cfg),
            revoked: RevocationList::default(),
        })
    }
}

fn token_issuer(cfg: &Config) -> TokenIssuer {
    let ttl = cfg.token_ttl_minutes * 60;
    match cfg.token_secret.as_deref() {
        Some(secret) => TokenIssuer::new(secret.as_bytes().to_vec(), ttl),
        None => {
            tracing::warn!("no token secret configured; tokens will not survive a restart");
            TokenIssuer::ephemeral(ttl)
        }
    }
}
