//! HTTP and WebSocket request handlers
//!
//! - `api` - Health check and the MQTT broker auth hook
//! - `device` - Device chat WebSocket upgrades
//! - `mcp` - Device MCP endpoint and tool listing

pub mod api;
pub mod device;
pub mod mcp;

// Re-export commonly used handlers for convenient access
pub use device::{bridge_chat_handler, chat_handler};
