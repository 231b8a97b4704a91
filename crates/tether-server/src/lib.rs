mod connection;
mod server;

pub use server::{build_router, AgentServer, ServerConfig, ServerHandle};
