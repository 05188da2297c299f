use super::factory::ConnectionFactory;
use super::proxy::CallProxy;
use crate::coordination::Coordinator;
use crate::discover::{AutoProvider, FixedProvider, PoolInvalidator, Provider};
use crate::pool::KeyedPool;
use crate::service::{ServiceDescriptor, ServiceIface};
use crate::transport::Transport;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use wrpc_core::{Result, WrpcConfig, WrpcErr};

/// RPC 客户端
///
/// 一个提供者、一个连接池，每个服务一个调用代理。由调用方创建并持有。
pub struct Client {
    provider: Arc<dyn Provider>,
    pool: Arc<KeyedPool<ConnectionFactory>>,
    proxies: HashMap<String, CallProxy>,
    closed: AtomicBool,
}

impl Client {
    /// 组装客户端并开始监听节点变化
    pub async fn new(
        config: &WrpcConfig,
        provider: Arc<dyn Provider>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let factory = ConnectionFactory::new(provider.clone(), transport)?;
        let pool = Arc::new(KeyedPool::new(factory, config.pool_config()));

        let invalidator: Arc<dyn PoolInvalidator> = pool.clone();
        let weak: Weak<dyn PoolInvalidator> = Arc::downgrade(&invalidator);
        provider.set_pool(weak);

        let policy = config.retry_policy();
        let proxies = provider
            .get_services()
            .into_iter()
            .map(|service| {
                let name = service.name().to_string();
                (name, CallProxy::new(service, pool.clone(), policy.clone()))
            })
            .collect();

        provider.listen().await?;

        Ok(Self {
            provider,
            pool,
            proxies,
            closed: AtomicBool::new(false),
        })
    }

    /// 按服务名取调用代理
    pub fn get_client(&self, name: &str) -> Result<&CallProxy> {
        self.proxies
            .get(name)
            .ok_or_else(|| WrpcErr::not_found_service(name))
    }

    /// 按服务类型取调用代理
    pub fn proxy<S: ServiceIface>(&self) -> Result<&CallProxy> {
        self.get_client(S::NAME)
    }

    pub async fn call(&self, service: &str, method: &str, args: Value) -> Result<Value> {
        self.check_open()?;
        self.get_client(service)?.call(method, args).await
    }

    pub async fn call_as<T: DeserializeOwned>(
        &self,
        service: &str,
        method: &str,
        args: Value,
    ) -> Result<T> {
        self.check_open()?;
        self.get_client(service)?.call_as(method, args).await
    }

    pub fn services(&self) -> Vec<ServiceDescriptor> {
        self.provider.get_services()
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn pool(&self) -> &Arc<KeyedPool<ConnectionFactory>> {
        &self.pool
    }

    /// 关闭所有空闲连接
    pub fn clear_pool(&self) {
        self.pool.clear(None);
    }

    /// 关闭客户端，可重复调用
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pool.clear(None);
        self.provider.close().await;
        log::info!("Client closed");
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WrpcErr::invalid_state("client is closed"));
        }
        Ok(())
    }
}

/// 创建客户端
///
/// 提供了注册中心时通过子节点监听发现服务，否则使用 `server_address` 静态地址。
pub async fn create_client(
    config: &WrpcConfig,
    services: Vec<ServiceDescriptor>,
    transport: Arc<dyn Transport>,
    coordinator: Option<Arc<dyn Coordinator>>,
) -> Result<Client> {
    config.validate()?;

    let provider: Arc<dyn Provider> = match coordinator {
        Some(coordinator) => Arc::new(AutoProvider::new(
            coordinator,
            &config.global_service,
            &config.version,
            services,
            config.load_balance,
        )),
        None => Arc::new(FixedProvider::new(
            &config.server_address,
            services,
            config.load_balance,
        )?),
    };

    Client::new(config, provider, transport).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::MockTransport;
    use crate::coordination::MemoryEnsemble;
    use serde_json::json;
    use std::time::Duration;

    struct Echo;

    impl ServiceIface for Echo {
        const NAME: &'static str = "Echo";
        const METHODS: &'static [&'static str] = &["echo"];
    }

    fn config() -> WrpcConfig {
        WrpcConfig::builder()
            .server_address("127.0.0.1:8603")
            .retry_interval(Duration::from_millis(5))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_fixed_client_calls() {
        let client = create_client(
            &config(),
            vec![ServiceDescriptor::of::<Echo>()],
            Arc::new(MockTransport::default()),
            None,
        )
        .await
        .unwrap();

        let value = client.call("Echo", "echo", json!([1, 2])).await.unwrap();
        assert_eq!(value["args"], json!([1, 2]));

        let proxy = client.proxy::<Echo>().unwrap();
        assert_eq!(proxy.service().name(), "Echo");
        assert!(matches!(
            client.get_client("Missing"),
            Err(WrpcErr::ServiceNotFound(_))
        ));

        assert_eq!(client.pool().idle_count("Echo"), 1);
        client.clear_pool();
        assert_eq!(client.pool().idle_count("Echo"), 0);

        client.close().await;
        client.close().await;
        assert!(matches!(
            client.call("Echo", "echo", json!(1)).await,
            Err(WrpcErr::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_unchecked_service_is_rejected() {
        let res = create_client(
            &config(),
            vec![ServiceDescriptor::open("Experimental").unchecked()],
            Arc::new(MockTransport::default()),
            None,
        )
        .await;
        assert!(matches!(res, Err(WrpcErr::NotSupported(_))));
    }

    #[tokio::test]
    async fn test_fixed_client_requires_address() {
        let config = WrpcConfig::default();
        let res = create_client(
            &config,
            vec![ServiceDescriptor::of::<Echo>()],
            Arc::new(MockTransport::default()),
            None,
        )
        .await;
        assert!(matches!(res, Err(WrpcErr::InvalidAddressConfig(_))));
    }

    #[tokio::test]
    async fn test_auto_client_without_servers() {
        let ensemble = MemoryEnsemble::new();
        let config = WrpcConfig::builder()
            .retry(2)
            .retry_interval(Duration::from_millis(5))
            .build()
            .unwrap();
        let client = create_client(
            &config,
            vec![ServiceDescriptor::of::<Echo>()],
            Arc::new(MockTransport::default()),
            Some(Arc::new(ensemble.connect(""))),
        )
        .await
        .unwrap();

        match client.call("Echo", "echo", json!(1)).await {
            Err(WrpcErr::CallFailed { attempts, source }) => {
                assert_eq!(attempts, 2);
                assert!(matches!(*source, WrpcErr::NoServerAvailable));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        client.close().await;
    }
}
