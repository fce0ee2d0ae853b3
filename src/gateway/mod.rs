//! Gateway server implementation

pub mod auth;
mod context;
pub mod pipeline;
mod router;
mod server;

pub use auth::{AuthGate, Principal};
pub use context::GatewayContext;
pub use pipeline::{Admission, Pipeline, RequestHead};
pub use router::{AppState, create_router};
pub use server::Gateway;
