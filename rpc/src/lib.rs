pub mod client;
pub mod subscription;

pub use client::{DaemonClient, DaemonClientOptions, DaemonEndpoint, RpcError};
pub use subscription::spawn_push_subscription;
