//! wrpc 的服务发现、负载均衡、连接池和重试调用
//!
//! 客户端：`Provider` 维护存活节点 → `ConnectionFactory` 按服务名建连 →
//! `KeyedPool` 复用连接 → `CallProxy` 负责重试。
//! 服务端：`Registrar` 以临时节点注册自己，会话恢复后自动补注册。

pub mod coordination;
pub mod discover;
pub mod pool;
pub mod service;
pub mod transport;

#[cfg(feature = "client")]
pub mod client;

#[cfg(feature = "server")]
pub mod app;

pub use coordination::{
    ChildrenListener, Coordinator, MemoryCoordinator, MemoryEnsemble, SessionListener,
    SessionState,
};
pub use discover::{AutoProvider, FixedProvider, LoadBalance, PoolInvalidator, Provider};
pub use pool::{KeyedPool, PoolFactory, Pooled};
pub use service::{ServiceDescriptor, ServiceIface};
pub use transport::{Channel, TcpTransport, Transport};

#[cfg(feature = "etcd")]
pub use coordination::{EtcdConfig, EtcdCoordinator};

#[cfg(feature = "server")]
pub use discover::{Registrar, RegistrarState};

#[cfg(feature = "client")]
pub use client::*;

#[cfg(feature = "server")]
pub use app::*;

pub use wrpc_core::{
    LoadBalanceStrategy, PoolConfig, Result, RetryPolicy, ServerConfig, ServerNode, WrpcConfig,
    WrpcErr,
};
