//! 注册中心抽象
//!
//! 客户端通过子节点监听发现服务节点，服务端以临时节点注册自己。
//! 路径都是相对于注册中心根路径（`/wrpc` 或 `/wrpc/{namespace}`）的。

mod memory;
#[cfg(feature = "etcd")]
mod etcd;
#[cfg(test)]
pub(crate) mod testing;

pub use memory::{MemoryCoordinator, MemoryEnsemble};
#[cfg(feature = "etcd")]
pub use etcd::{EtcdConfig, EtcdCoordinator};

use async_trait::async_trait;
use std::sync::Arc;
use wrpc_core::Result;

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Lost,
    Suspended,
}

/// 子节点变化监听
///
/// 同一个监听的回调不会并发执行，按变化顺序依次送达。
#[async_trait]
pub trait ChildrenListener: Send + Sync + 'static {
    async fn on_children(&self, children: Vec<String>);
}

/// 会话状态监听
#[async_trait]
pub trait SessionListener: Send + Sync + 'static {
    async fn on_state(&self, state: SessionState);
}

#[async_trait]
impl<F> ChildrenListener for F
where
    F: Fn(Vec<String>) + Send + Sync + 'static,
{
    async fn on_children(&self, children: Vec<String>) {
        self(children)
    }
}

#[async_trait]
impl<F> SessionListener for F
where
    F: Fn(SessionState) + Send + Sync + 'static,
{
    async fn on_state(&self, state: SessionState) {
        self(state)
    }
}

/// 注册中心客户端
#[async_trait]
pub trait Coordinator: Send + Sync + 'static {
    /// 递归创建持久节点
    async fn ensure_path(&self, path: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// 创建节点，已存在时返回 `NodeExists`
    async fn create(&self, path: &str, ephemeral: bool) -> Result<()>;

    /// 删除节点，不存在时返回 `NoNode`
    async fn delete(&self, path: &str) -> Result<()>;

    /// 监听子节点，安装时立即回调一次当前子节点
    async fn children_watch(&self, path: &str, listener: Arc<dyn ChildrenListener>) -> Result<()>;

    async fn add_session_listener(&self, listener: Arc<dyn SessionListener>);

    /// 关闭客户端，临时节点随会话一起消失；可重复调用
    async fn close(&self);
}

/// 把相对路径拼到根路径下
pub(crate) fn join_path(root: &str, path: &str) -> String {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        root.to_string()
    } else {
        format!("{}/{}", root.trim_end_matches('/'), path)
    }
}

/// 父路径，根节点返回 `None`
pub(crate) fn parent_of(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}
