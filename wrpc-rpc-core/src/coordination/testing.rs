use super::{ChildrenListener, Coordinator, MemoryCoordinator, SessionListener};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use wrpc_core::{Result, WrpcErr};

/// 包一层内存客户端，前 n 次 `create` 返回连接丢失
pub struct FlakyCoordinator {
    inner: MemoryCoordinator,
    failing_creates: AtomicUsize,
}

impl FlakyCoordinator {
    pub fn new(inner: MemoryCoordinator, failing_creates: usize) -> Self {
        Self {
            inner,
            failing_creates: AtomicUsize::new(failing_creates),
        }
    }
}

#[async_trait]
impl Coordinator for FlakyCoordinator {
    async fn ensure_path(&self, path: &str) -> Result<()> {
        self.inner.ensure_path(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.inner.exists(path).await
    }

    async fn create(&self, path: &str, ephemeral: bool) -> Result<()> {
        let failed = self
            .failing_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(WrpcErr::coordination_error("connection loss"));
        }
        self.inner.create(path, ephemeral).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.inner.delete(path).await
    }

    async fn children_watch(&self, path: &str, listener: Arc<dyn ChildrenListener>) -> Result<()> {
        self.inner.children_watch(path, listener).await
    }

    async fn add_session_listener(&self, listener: Arc<dyn SessionListener>) {
        self.inner.add_session_listener(listener).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}
