use super::load_balance::{new_load_balance, LoadBalance};
use crate::coordination::{ChildrenListener, Coordinator};
use crate::service::ServiceDescriptor;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use wrpc_core::config::service_parent_path;
use wrpc_core::node::parse_server_address;
use wrpc_core::{LoadBalanceStrategy, Result, ServerNode};

/// 节点变化时需要清理的连接池
pub trait PoolInvalidator: Send + Sync + 'static {
    /// 关闭某个服务（或全部服务）的空闲连接
    fn clear(&self, key: Option<&str>);
}

/// 服务节点提供者
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    fn select(&self) -> Result<ServerNode>;

    fn get_services(&self) -> Vec<ServiceDescriptor>;

    /// 当前存活节点
    fn live_nodes(&self) -> Vec<ServerNode>;

    fn set_pool(&self, pool: Weak<dyn PoolInvalidator>);

    /// 开始监听节点变化
    async fn listen(&self) -> Result<()>;

    async fn close(&self);
}

/// 静态地址列表
pub struct FixedProvider {
    services: Vec<ServiceDescriptor>,
    nodes: Vec<ServerNode>,
    load: Arc<dyn LoadBalance>,
}

impl FixedProvider {
    /// 创建静态提供者，地址格式不合法时返回 `InvalidAddressConfig`
    pub fn new(
        server_address: &str,
        services: Vec<ServiceDescriptor>,
        strategy: LoadBalanceStrategy,
    ) -> Result<Self> {
        let nodes = parse_server_address(server_address)?;
        let load = new_load_balance(strategy);
        load.set_nodes(&nodes);
        log::info!("Fixed provider created with nodes: {}", server_address);

        Ok(Self {
            services,
            nodes,
            load,
        })
    }
}

#[async_trait]
impl Provider for FixedProvider {
    fn select(&self) -> Result<ServerNode> {
        self.load.get_node()
    }

    fn get_services(&self) -> Vec<ServiceDescriptor> {
        self.services.clone()
    }

    fn live_nodes(&self) -> Vec<ServerNode> {
        self.nodes.clone()
    }

    fn set_pool(&self, _pool: Weak<dyn PoolInvalidator>) {}

    async fn listen(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {}
}

/// 通过注册中心子节点监听发现服务
pub struct AutoProvider {
    coordinator: Arc<dyn Coordinator>,
    inner: Arc<AutoInner>,
    listening: AtomicBool,
}

struct AutoInner {
    path: String,
    services: Vec<ServiceDescriptor>,
    strategy: LoadBalanceStrategy,
    membership: RwLock<Arc<Membership>>,
    pool: RwLock<Option<Weak<dyn PoolInvalidator>>>,
}

/// 一次回调构建出的节点集合和对应的选择列表，整体替换
struct Membership {
    nodes: Vec<ServerNode>,
    load: Arc<dyn LoadBalance>,
}

impl Membership {
    fn new(nodes: Vec<ServerNode>, strategy: LoadBalanceStrategy) -> Self {
        let load = new_load_balance(strategy);
        load.set_nodes(&nodes);
        Self { nodes, load }
    }
}

impl AutoInner {
    fn membership(&self) -> Arc<Membership> {
        self.membership.read().clone()
    }
}

impl AutoProvider {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        global_service: &str,
        version: &str,
        services: Vec<ServiceDescriptor>,
        strategy: LoadBalanceStrategy,
    ) -> Self {
        Self {
            coordinator,
            inner: Arc::new(AutoInner {
                path: service_parent_path(global_service, version),
                services,
                strategy,
                membership: RwLock::new(Arc::new(Membership::new(Vec::new(), strategy))),
                pool: RwLock::new(None),
            }),
            listening: AtomicBool::new(false),
        }
    }

    /// 监听的路径 `/{global_service}/{version}`
    pub fn path(&self) -> &str {
        &self.inner.path
    }
}

#[async_trait]
impl ChildrenListener for AutoInner {
    async fn on_children(&self, children: Vec<String>) {
        let mut nodes: Vec<ServerNode> = Vec::with_capacity(children.len());
        for child in &children {
            match child.parse::<ServerNode>() {
                Ok(node) if !nodes.contains(&node) => nodes.push(node),
                Ok(_) => {}
                Err(e) => log::warn!("Skip malformed server node `{}`: {}", child, e),
            }
        }

        if nodes.is_empty() {
            log::warn!("Server not found under {}", self.path);
        } else {
            log::info!("Child node changed under {}: {:?}", self.path, children);
        }

        let membership = Arc::new(Membership::new(nodes, self.strategy));
        *self.membership.write() = membership;

        let pool = self.pool.read().as_ref().and_then(Weak::upgrade);
        if let Some(pool) = pool {
            for service in &self.services {
                pool.clear(Some(service.name()));
            }
        }
    }
}

#[async_trait]
impl Provider for AutoProvider {
    fn select(&self) -> Result<ServerNode> {
        self.inner.membership().load.get_node()
    }

    fn get_services(&self) -> Vec<ServiceDescriptor> {
        self.inner.services.clone()
    }

    fn live_nodes(&self) -> Vec<ServerNode> {
        self.inner.membership().nodes.clone()
    }

    fn set_pool(&self, pool: Weak<dyn PoolInvalidator>) {
        *self.inner.pool.write() = Some(pool);
    }

    async fn listen(&self) -> Result<()> {
        if self.listening.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::info!("Watching server nodes under {}", self.inner.path);
        let listener: Arc<dyn ChildrenListener> = self.inner.clone();
        if let Err(e) = self.coordinator.children_watch(&self.inner.path, listener).await {
            self.listening.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    async fn close(&self) {
        let pool = self.inner.pool.write().take().and_then(|p| p.upgrade());
        if let Some(pool) = pool {
            pool.clear(None);
        }
        self.coordinator.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryEnsemble;
    use parking_lot::Mutex;
    use std::time::Duration;
    use wrpc_core::WrpcErr;

    #[derive(Default)]
    struct RecordingPool {
        cleared: Mutex<Vec<Option<String>>>,
    }

    impl PoolInvalidator for RecordingPool {
        fn clear(&self, key: Option<&str>) {
            self.cleared.lock().push(key.map(str::to_string));
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_fixed_provider() {
        let provider = FixedProvider::new(
            "127.0.0.1:8603,127.0.0.2:8603:2",
            vec![ServiceDescriptor::open("Echo")],
            LoadBalanceStrategy::RoundRobin,
        )
        .unwrap();

        assert_eq!(provider.live_nodes().len(), 2);
        assert_eq!(provider.get_services()[0].name(), "Echo");
        assert!(provider.live_nodes().contains(&provider.select().unwrap()));
    }

    #[test]
    fn test_fixed_provider_rejects_bad_address() {
        let res = FixedProvider::new("localhost:8603", vec![], LoadBalanceStrategy::Random);
        assert!(matches!(res, Err(WrpcErr::InvalidAddressConfig(_))));
    }

    #[tokio::test]
    async fn test_auto_provider_follows_membership() {
        let ensemble = MemoryEnsemble::new();
        let server = ensemble.connect("");
        let provider = AutoProvider::new(
            Arc::new(ensemble.connect("")),
            "com.demo.service",
            "1.0.0",
            vec![ServiceDescriptor::open("Echo")],
            LoadBalanceStrategy::RoundRobin,
        );
        let pool = Arc::new(RecordingPool::default());
        let weak: Weak<dyn PoolInvalidator> = Arc::downgrade(&(pool.clone() as Arc<dyn PoolInvalidator>));
        provider.set_pool(weak);
        provider.listen().await.unwrap();
        provider.listen().await.unwrap();

        wait_for(|| !pool.cleared.lock().is_empty()).await;
        assert!(matches!(provider.select(), Err(WrpcErr::NoServerAvailable)));

        server.ensure_path("/com.demo.service/1.0.0").await.unwrap();
        server
            .create("/com.demo.service/1.0.0/10.0.0.1:8603:1", true)
            .await
            .unwrap();
        server
            .create("/com.demo.service/1.0.0/not-a-node", true)
            .await
            .unwrap();

        wait_for(|| provider.live_nodes().len() == 1).await;
        assert_eq!(provider.select().unwrap().host_port(), "10.0.0.1:8603");
        assert!(pool
            .cleared
            .lock()
            .iter()
            .all(|key| key.as_deref() == Some("Echo")));

        server.close().await;
        wait_for(|| provider.live_nodes().is_empty()).await;
        assert!(matches!(provider.select(), Err(WrpcErr::NoServerAvailable)));

        provider.close().await;
        assert_eq!(pool.cleared.lock().last().cloned(), Some(None));
    }

    fn auto_provider(ensemble: &MemoryEnsemble) -> AutoProvider {
        AutoProvider::new(
            Arc::new(ensemble.connect("")),
            "com.demo.service",
            "1.0.0",
            vec![ServiceDescriptor::open("Echo")],
            LoadBalanceStrategy::RoundRobin,
        )
    }

    #[tokio::test]
    async fn test_oversized_weight_child_is_skipped() {
        let ensemble = MemoryEnsemble::new();
        let provider = auto_provider(&ensemble);

        provider
            .inner
            .on_children(vec![
                "10.0.0.1:80:4000000000".to_string(),
                "10.0.0.2:80:2".to_string(),
            ])
            .await;

        let live = provider.live_nodes();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].host_port(), "10.0.0.2:80");
        assert_eq!(provider.select().unwrap().host_port(), "10.0.0.2:80");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_selection_always_comes_from_published_nodes() {
        let ensemble = MemoryEnsemble::new();
        let provider = Arc::new(auto_provider(&ensemble));
        let sets = [
            vec!["10.0.0.1:80:1".to_string(), "10.0.0.2:80:3".to_string()],
            vec!["10.0.0.3:80:2".to_string()],
        ];

        let writer = {
            let provider = provider.clone();
            tokio::spawn(async move {
                for round in 0..200 {
                    provider.inner.on_children(sets[round % 2].clone()).await;
                    tokio::task::yield_now().await;
                }
            })
        };
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let provider = provider.clone();
                tokio::spawn(async move {
                    for _ in 0..500 {
                        let membership = provider.inner.membership();
                        if let Ok(node) = membership.load.get_node() {
                            assert!(membership.nodes.contains(&node));
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
        assert_eq!(provider.live_nodes().len(), 1);
        assert_eq!(provider.select().unwrap().host_port(), "10.0.0.3:80");
    }
}
