//! HTTP surface of the daemon.

pub mod handlers;
pub mod routes;

pub use handlers::AppState;
pub use routes::create_router;
