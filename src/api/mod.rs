//! Method dispatch shared by the HTTP and sidecar transports.

pub mod error;
pub mod guard;
pub mod handlers;
pub mod lookup;
pub mod params;
pub mod router;
pub mod types;

pub use error::{err, ok, HandlerErr};
pub use guard::Auth;
pub use router::handle_request;
pub use types::{AppState, Request};
