use std::time::Instant;

use super::error::err;
use super::guard::Auth;
use super::handlers;
use super::types::{AppState, Request};

type TryHandle = fn(&mut AppState, &Request, &Auth) -> Option<serde_json::Value>;

const HANDLERS: &[TryHandle] = &[
    handlers::site::try_handle,
    handlers::auth::try_handle,
    handlers::users::try_handle,
    handlers::branches::try_handle,
    handlers::classes::try_handle,
    handlers::subjects::try_handle,
    handlers::students::try_handle,
    handlers::scores::try_handle,
    handlers::attendance::try_handle,
    handlers::finance::try_handle,
    handlers::reports::try_handle,
    handlers::content::try_handle,
    handlers::settings::try_handle,
    handlers::dashboard::try_handle,
    handlers::portal::try_handle,
    handlers::backup::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    let started = Instant::now();
    let now = chrono::Utc::now().timestamp();
    let auth = Auth::resolve(state, req.token.as_deref(), now);

    let resp = HANDLERS
        .iter()
        .find_map(|h| h(state, &req, &auth))
        .unwrap_or_else(|| {
            err(
                &req.id,
                "not_implemented",
                format!("unknown method: {}", req.method),
                None,
            )
        });

    let outcome = resp
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("ok");
    tracing::info!(
        method = %req.method,
        outcome,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "handled request"
    );
    resp
}
