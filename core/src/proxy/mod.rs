//! Proxy module - HTTP bridge in front of the Responses backend

pub mod error;
pub mod handlers;
pub mod server;
pub mod upstream;

pub use error::ProxyError;
pub use server::{router, AppState, ProxyServer};
