// termbridge: interactive shell sessions over WebSocket and REST
//
// The session core lives in `termbridge-terminal`; this crate wires it to an
// axum server, a layered configuration and the tracing subscriber.

pub mod cli;
pub mod config;
pub mod logging;
pub mod web;

pub use cli::Cli;
pub use config::{AppConfig, ServerConfig};
pub use web::WebServer;
