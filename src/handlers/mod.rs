//! HTTP and WebSocket request handlers
//!
//! - `api` - Health check endpoint
//! - `realtime` - Turn-scheduled conversation WebSocket

pub mod api;
pub mod realtime;

pub use realtime::realtime_handler;
