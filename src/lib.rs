pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod trongrid;

// Re-export the engine surface most callers need
pub use client::GatewayClient;
pub use config::{load_config, Config};
pub use error::{GatewayError, Result};

// Re-export the request/response vocabulary
pub use api::{
    BatchResponse, FreezeVerdict, GatewayResponse, KeyPoolStats, Release, RequestOptions, Targets,
};
pub use trongrid::{TronGridClient, Trc20Query};
