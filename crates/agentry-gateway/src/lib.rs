//! Agentry gateway — the HTTP control plane over the hub.

pub mod auth;
pub mod server;

pub use auth::ResolvedAuth;
pub use server::{router, serve, AppState};
