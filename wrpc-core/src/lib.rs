pub mod config;
pub mod error;
pub mod ip;
pub mod logging;
pub mod node;

pub use config::{
    LoadBalanceStrategy, PoolConfig, RetryPolicy, ServerConfig, WrpcConfig, WrpcConfigBuilder,
};
pub use error::{ErrorCode, Result, WrpcErr};
pub use ip::{FixedIpResolver, IpResolver, LocalIpResolver};
pub use node::{check_hosts, parse_server_address, ServerNode};
