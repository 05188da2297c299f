//! 传输层：打开到 `host:port` 的连接，按服务名复用同一种连接发起调用

pub mod codec;
mod tcp;

pub use tcp::{TcpChannel, TcpTransport};

use async_trait::async_trait;
use serde_json::Value;
use wrpc_core::Result;

/// 一条到服务节点的连接
#[async_trait]
pub trait Channel: Send + 'static {
    /// 调用 `service` 的 `method`，服务端业务异常以错误码还原
    async fn invoke(&mut self, service: &str, method: &str, args: Value) -> Result<Value>;

    /// 关闭连接，不返回错误
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// 打开连接，失败返回 `ConnectionError`
    async fn open(&self, host: &str, port: u16) -> Result<Box<dyn Channel>>;
}
