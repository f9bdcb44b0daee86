// Web frontend module
pub mod multiplexer;
pub mod protocol;
pub mod routes;
pub mod server;

pub use multiplexer::Connection;
pub use protocol::{ClientCommand, CreateRequest, ServerFrame, ServerKind};
pub use routes::{create_router, AppError, AppState};
pub use server::WebServer;
