pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod shutdown;
pub mod store;
pub mod worker;

/// Identifies one connection for the lifetime of the broker process.
pub type ConnectionId = u64;
