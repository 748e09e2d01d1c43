//! telemetry-bridge: relays edge telemetry to a model service
//!
//! Edge devices connect over TCP and speak a small binary protocol. The
//! first samples of each connection train a model on the model service;
//! after training every sample is answered with a prediction.
//!
//! Features:
//! - Model service client shared by all connections
//! - One task per connection, frames processed in arrival order
//! - Connection limit and graceful shutdown
//! - Configuration via CLI arguments or TOML file

pub mod config;
pub mod protocol;
pub mod server;
pub mod service;
pub mod session;
