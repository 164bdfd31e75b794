use crate::api::error::{reply, HandlerErr};
use crate::api::guard::Auth;
use crate::api::params::req_str;
use crate::api::types::{AppState, Request};
use crate::backup;
use crate::db;
use serde_json::{json, Value};
use std::path::PathBuf;

fn io_err(e: anyhow::Error) -> HandlerErr {
    HandlerErr::new("io_failed", format!("{e:#}"))
}

fn backup_export(state: &mut AppState, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    auth.admin()?;
    let out_path = PathBuf::from(req_str(params, "outPath")?);
    let summary = backup::export_bundle(&state.db, &state.data_dir, &out_path).map_err(io_err)?;
    tracing::info!(path = %out_path.display(), bytes = summary.bytes, "backup exported");
    Ok(json!({
        "ok": true,
        "path": out_path.to_string_lossy(),
        "bundleFormat": summary.bundle_format,
        "entryCount": summary.entry_count,
        "bytes": summary.bytes,
    }))
}

fn backup_import(state: &mut AppState, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    auth.admin()?;
    let in_path = PathBuf::from(req_str(params, "inPath")?);
    if !in_path.is_file() {
        return Err(HandlerErr::not_found("backup file"));
    }

    // The file connection has to be closed before its database is replaced.
    let placeholder = db::open_in_memory().map_err(io_err)?;
    drop(std::mem::replace(&mut state.db, placeholder));

    let imported = backup::import_bundle(&in_path, &state.data_dir);
    // Reopen whatever is on disk now, the old file when the import failed.
    state.db = db::open_db(&state.data_dir).map_err(io_err)?;
    let summary = imported.map_err(io_err)?;
    tracing::info!(path = %in_path.display(), format = %summary.bundle_format_detected, "backup imported");
    Ok(json!({
        "ok": true,
        "bundleFormatDetected": summary.bundle_format_detected,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request, auth: &Auth) -> Option<Value> {
    let result = match req.method.as_str() {
        "backup.export" => backup_export(state, auth, &req.params),
        "backup.import" => backup_import(state, auth, &req.params),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
