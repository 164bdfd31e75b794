//! HTTP front end. Each REST route names one api method; the request's path
//! captures, query string and JSON body are merged into that method's params.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{on, MethodFilter, MethodRouter};
use axum::{Json, Router};
use serde_json::{Map, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::{err, handle_request, AppState, Request};
use crate::config::Config;

pub type SharedState = Arc<Mutex<AppState>>;

#[derive(Debug, Clone, Copy)]
enum Verb {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Verb {
    fn filter(self) -> MethodFilter {
        match self {
            Verb::Get => MethodFilter::GET,
            Verb::Post => MethodFilter::POST,
            Verb::Put => MethodFilter::PUT,
            Verb::Patch => MethodFilter::PATCH,
            Verb::Delete => MethodFilter::DELETE,
        }
    }
}

#[derive(Debug)]
struct Route {
    verb: Verb,
    path: &'static str,
    method: &'static str,
    /// Success is answered with the `html` field of the result as a page.
    html: bool,
}

const fn r(verb: Verb, path: &'static str, method: &'static str) -> Route {
    Route { verb, path, method, html: false }
}

const fn page(path: &'static str, method: &'static str) -> Route {
    Route { verb: Verb::Get, path, method, html: true }
}

use Verb::{Delete, Get, Patch, Post, Put};

static ROUTES: &[Route] = &[
    r(Get, "/api/health", "health"),
    r(Get, "/api/site", "site.info"),
    r(Get, "/api/site/news", "site.news.list"),
    r(Post, "/api/site/contact", "site.contact.submit"),
    r(Post, "/api/auth/login", "auth.login"),
    r(Post, "/api/auth/logout", "auth.logout"),
    r(Get, "/api/auth/me", "auth.me"),
    r(Post, "/api/auth/password", "auth.changePassword"),
    r(Get, "/api/users", "users.list"),
    r(Post, "/api/users", "users.create"),
    r(Patch, "/api/users/:userId", "users.update"),
    r(Delete, "/api/users/:userId", "users.delete"),
    r(Get, "/api/branches", "branches.list"),
    r(Post, "/api/branches", "branches.create"),
    r(Patch, "/api/branches/:branchId", "branches.update"),
    r(Delete, "/api/branches/:branchId", "branches.delete"),
    r(Get, "/api/classes", "classes.list"),
    r(Post, "/api/classes", "classes.create"),
    r(Patch, "/api/classes/:classId", "classes.update"),
    r(Delete, "/api/classes/:classId", "classes.delete"),
    r(Get, "/api/classes/:classId/subjects", "subjects.list"),
    r(Post, "/api/classes/:classId/subjects", "subjects.create"),
    r(Get, "/api/classes/:classId/publications", "scores.publications"),
    r(Patch, "/api/subjects/:subjectId", "subjects.update"),
    r(Delete, "/api/subjects/:subjectId", "subjects.delete"),
    r(Post, "/api/subjects/copy", "subjects.copy"),
    r(Get, "/api/students", "students.list"),
    r(Post, "/api/students", "students.create"),
    r(Post, "/api/students/upload", "students.bulkUpload"),
    r(Post, "/api/students/promote", "students.promote"),
    r(Get, "/api/students/:studentId", "students.get"),
    r(Patch, "/api/students/:studentId", "students.update"),
    r(Delete, "/api/students/:studentId", "students.delete"),
    r(Post, "/api/students/:studentId/active", "students.setActive"),
    r(Post, "/api/students/:studentId/transfer", "students.transfer"),
    r(Post, "/api/students/:studentId/password", "students.resetPassword"),
    r(Get, "/api/scores", "scores.get"),
    r(Put, "/api/scores", "scores.save"),
    r(Post, "/api/scores/upload", "scores.upload"),
    r(Get, "/api/scores/template", "scores.template"),
    r(Post, "/api/scores/publish", "scores.publish"),
    r(Get, "/api/attendance", "attendance.get"),
    r(Post, "/api/attendance", "attendance.mark"),
    r(Get, "/api/attendance/summary", "attendance.summary"),
    r(Get, "/api/fees", "fees.list"),
    r(Post, "/api/fees", "fees.create"),
    r(Patch, "/api/fees/:feeId", "fees.update"),
    r(Delete, "/api/fees/:feeId", "fees.delete"),
    r(Get, "/api/payments", "payments.list"),
    r(Post, "/api/payments", "payments.record"),
    r(Delete, "/api/payments/:paymentId", "payments.delete"),
    r(Get, "/api/finance/balances", "finance.balances"),
    r(Get, "/api/finance/statement/:studentId", "finance.statement"),
    r(Get, "/api/finance/summary", "finance.summary"),
    r(Get, "/api/reports/broadsheet", "reports.broadsheet"),
    r(Get, "/api/reports/card/:studentId", "reports.card"),
    page("/api/reports/card/:studentId/html", "reports.cardHtml"),
    page("/api/reports/class/:classId/html", "reports.classCardsHtml"),
    r(Put, "/api/reports/remarks", "reports.remarks.set"),
    r(Get, "/api/news", "news.list"),
    r(Post, "/api/news", "news.create"),
    r(Patch, "/api/news/:newsId", "news.update"),
    r(Delete, "/api/news/:newsId", "news.delete"),
    r(Get, "/api/notifications", "notifications.list"),
    r(Post, "/api/notifications", "notifications.create"),
    r(Delete, "/api/notifications/:notificationId", "notifications.delete"),
    r(Get, "/api/contact", "contact.list"),
    r(Post, "/api/contact/:messageId/handled", "contact.markHandled"),
    r(Get, "/api/settings", "settings.get"),
    r(Patch, "/api/settings", "settings.update"),
    r(Get, "/api/dashboard", "dashboard.stats"),
    r(Get, "/api/portal/profile", "portal.profile"),
    r(Get, "/api/portal/scores", "portal.scores"),
    page("/api/portal/report-card", "portal.reportCard"),
    r(Get, "/api/portal/fees", "portal.fees"),
    r(Get, "/api/portal/notifications", "portal.notifications"),
    r(Post, "/api/portal/notifications/:notificationId/read", "portal.notifications.markRead"),
    r(Post, "/api/backup/export", "backup.export"),
    r(Post, "/api/backup/import", "backup.import"),
];

/// Query-string values are text; these keys are converted before dispatch.
const INTEGER_KEYS: &[&str] = &["term", "level", "limit", "currentTerm"];
const BOOL_KEYS: &[&str] = &["includeInactive", "handled", "dryRun", "published", "active"];

pub fn build_router(state: SharedState, cors_permissive: bool) -> Router {
    let mut table: Vec<(&'static str, Option<MethodRouter<SharedState>>)> = Vec::new();
    for route in ROUTES {
        let handler = move |State(state): State<SharedState>,
                            path: Option<Path<HashMap<String, String>>>,
                            Query(query): Query<HashMap<String, String>>,
                            headers: HeaderMap,
                            body: Bytes| async move {
            let path = path.map(|Path(p)| p).unwrap_or_default();
            dispatch(state, route, path, query, headers, body).await
        };
        match table.iter_mut().find(|(p, _)| *p == route.path) {
            Some((_, slot)) => {
                let merged = slot.take().map(|mr| mr.on(route.verb.filter(), handler));
                *slot = merged;
            }
            None => table.push((route.path, Some(on(route.verb.filter(), handler)))),
        }
    }

    let mut app = Router::new().route("/rpc", axum::routing::post(rpc));
    for (path, method_router) in table {
        if let Some(mr) = method_router {
            app = app.route(path, mr);
        }
    }
    let cors = if cors_permissive {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
    };
    app.layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Runs one request on the blocking pool; the database lives behind the mutex.
pub async fn run(state: SharedState, req: Request) -> Value {
    let id = req.id.clone();
    let joined = tokio::task::spawn_blocking(move || {
        let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
        handle_request(&mut guard, req)
    })
    .await;
    joined.unwrap_or_else(|e| err(&id, "internal", format!("request task failed: {e}"), None))
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = raw
        .strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))?;
    Some(token.trim().to_string())
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn query_value(key: &str, raw: &str) -> Value {
    if INTEGER_KEYS.contains(&key) {
        if let Ok(n) = raw.trim().parse::<i64>() {
            return Value::from(n);
        }
    }
    if BOOL_KEYS.contains(&key) {
        match raw.trim() {
            "true" | "1" => return Value::Bool(true),
            "false" | "0" => return Value::Bool(false),
            _ => {}
        }
    }
    Value::String(raw.to_string())
}

/// Body first, then query, then path captures; later sources win.
fn merge_params(
    body: &Bytes,
    query: &HashMap<String, String>,
    path: &HashMap<String, String>,
) -> Result<Value, String> {
    let mut params = if body.iter().all(u8::is_ascii_whitespace) {
        Map::new()
    } else {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err("request body must be a JSON object".to_string()),
            Err(e) => return Err(format!("request body is not valid JSON: {e}")),
        }
    };
    for (k, v) in query {
        params.insert(k.clone(), query_value(k, v));
    }
    for (k, v) in path {
        params.insert(k.clone(), Value::String(v.clone()));
    }
    Ok(Value::Object(params))
}

pub fn status_for(code: &str) -> StatusCode {
    match code {
        "bad_params" | "bad_json" | "upload_failed" => StatusCode::BAD_REQUEST,
        "unauthorized" => StatusCode::UNAUTHORIZED,
        "forbidden" => StatusCode::FORBIDDEN,
        "not_found" => StatusCode::NOT_FOUND,
        "conflict" => StatusCode::CONFLICT,
        "not_implemented" => StatusCode::NOT_IMPLEMENTED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn into_response(resp: Value, html: bool) -> Response {
    if resp.get("ok").and_then(Value::as_bool) == Some(true) {
        if html {
            if let Some(page) = resp.pointer("/result/html").and_then(Value::as_str) {
                return Html(page.to_string()).into_response();
            }
        }
        return (StatusCode::OK, Json(resp)).into_response();
    }
    let code = resp
        .pointer("/error/code")
        .and_then(Value::as_str)
        .unwrap_or("internal");
    (status_for(code), Json(resp)).into_response()
}

async fn dispatch(
    state: SharedState,
    route: &'static Route,
    path: HashMap<String, String>,
    query: HashMap<String, String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let id = request_id(&headers);
    let params = match merge_params(&body, &query, &path) {
        Ok(p) => p,
        Err(message) => return into_response(err(&id, "bad_json", message, None), false),
    };
    let mut req = Request::new(id, route.method, params);
    req.token = bearer(&headers);
    into_response(run(state, req).await, route.html)
}

/// The sidecar envelope over HTTP: `{id?, method, params?, token?}`.
async fn rpc(State(state): State<SharedState>, headers: HeaderMap, body: Bytes) -> Response {
    let fallback_id = request_id(&headers);
    let mut req: Request = match serde_json::from_slice::<Value>(&body) {
        Ok(mut v) => {
            if let Some(obj) = v.as_object_mut() {
                obj.entry("id").or_insert_with(|| Value::String(fallback_id.clone()));
            }
            match serde_json::from_value(v) {
                Ok(req) => req,
                Err(e) => return into_response(err(&fallback_id, "bad_json", e.to_string(), None), false),
            }
        }
        Err(e) => return into_response(err(&fallback_id, "bad_json", e.to_string(), None), false),
    };
    if req.token.is_none() {
        req.token = bearer(&headers);
    }
    if req.params.is_null() {
        req.params = Value::Object(Map::new());
    }
    into_response(run(state, req).await, false)
}

pub async fn serve(cfg: Config) -> anyhow::Result<()> {
    let state = AppState::open(&cfg)?;
    let app = build_router(Arc::new(Mutex::new(state)), cfg.cors_permissive);
    let listener = tokio::net::TcpListener::bind(&cfg.bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.bind))?;
    tracing::info!(bind = %cfg.bind, data_dir = %cfg.data_dir.display(), "http server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;
    tracing::info!("http server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_route_names_a_distinct_verb_and_path() {
        let mut seen = std::collections::HashSet::new();
        for route in ROUTES {
            assert!(
                seen.insert((format!("{:?}", route.verb), route.path)),
                "duplicate route {:?} {}",
                route.verb,
                route.path
            );
        }
    }

    #[test]
    fn path_captures_win_over_body_and_query() {
        let body = Bytes::from_static(br#"{"studentId":"from-body","term":1}"#);
        let query: HashMap<String, String> = [("term".to_string(), "2".to_string())].into();
        let path: HashMap<String, String> = [("studentId".to_string(), "from-path".to_string())].into();
        let params = merge_params(&body, &query, &path).expect("merge");
        assert_eq!(params["studentId"], "from-path");
        assert_eq!(params["term"], 2);
    }

    #[test]
    fn query_flags_are_typed() {
        assert_eq!(query_value("includeInactive", "true"), Value::Bool(true));
        assert_eq!(query_value("search", "12"), Value::String("12".to_string()));
        assert_eq!(query_value("limit", "x"), Value::String("x".to_string()));
    }

    #[test]
    fn non_object_bodies_are_rejected() {
        let empty = HashMap::new();
        assert!(merge_params(&Bytes::from_static(b"[1,2]"), &empty, &empty).is_err());
        assert!(merge_params(&Bytes::from_static(b"  "), &empty, &empty).is_ok());
    }

    #[test]
    fn bearer_header_is_extracted() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc.def".parse().expect("header"));
        assert_eq!(bearer(&headers).as_deref(), Some("abc.def"));
    }
}
