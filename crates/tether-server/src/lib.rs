pub mod auth;
pub mod config;
pub mod error;
pub mod event_bridge;
pub mod handlers;
pub mod server;
pub mod sessions;

pub use config::{load_config, TetherConfig};
pub use error::ServerError;
pub use handlers::{AppState, SessionContext};
pub use server::{build_router, start, ServerHandle};
pub use sessions::{Disconnect, DisconnectReason, SessionRegistry};
