pub mod config;
pub mod error;
pub mod images;
pub mod logging;
pub mod models;
pub mod proxy;
pub mod server;
pub mod tool_calls;
pub mod translate;
pub mod usage;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use server::{build_router, AppState};
