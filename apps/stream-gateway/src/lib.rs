pub mod config;
pub mod http;

pub use config::GatewayConfig;
pub use http::{build_router, conversation_stream, GatewayState, StreamItem};
