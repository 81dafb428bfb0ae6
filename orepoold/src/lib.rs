pub mod config;
pub mod daemon;
pub mod pool;
pub mod tracing_setup;

pub use config::{ClusterConfig, CoinConfig, ConfigError, PoolConfig};
pub use pool::Pool;
