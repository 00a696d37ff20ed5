//! taxora-gateway - HTTP API for the Taxora finance assistant
//!
//! Serves chat sessions and provider management on top of the
//! [`taxora_core::ProviderRouter`].

pub mod auth;
pub mod protocol;
pub mod server;
pub mod session;

pub use server::{GatewayServer, GatewayState};
pub use session::{SessionInfo, SessionStore};
