//! School administration service: classes, students, scores, attendance,
//! fees and report cards for a multi-branch school.
//!
//! The same request router is reachable over HTTP (`http`) and over a
//! newline-delimited JSON pipe (`sidecar`).

pub mod api;
pub mod auth;
pub mod backup;
pub mod calc;
pub mod config;
pub mod db;
pub mod http;
pub mod reconcile;
pub mod report;
pub mod results;
pub mod sidecar;
pub mod workbook;

pub use api::{handle_request, AppState, Request};
pub use config::Config;
