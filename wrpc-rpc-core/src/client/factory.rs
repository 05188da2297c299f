use crate::discover::Provider;
use crate::pool::PoolFactory;
use crate::service::ServiceDescriptor;
use crate::transport::{Channel, Transport};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use wrpc_core::{Result, ServerNode, WrpcErr};

/// 绑定到某个节点和某个服务的连接
pub struct RpcConnection {
    service: ServiceDescriptor,
    node: ServerNode,
    channel: Box<dyn Channel>,
}

impl RpcConnection {
    pub fn new(service: ServiceDescriptor, node: ServerNode, channel: Box<dyn Channel>) -> Self {
        Self {
            service,
            node,
            channel,
        }
    }

    pub fn service(&self) -> &ServiceDescriptor {
        &self.service
    }

    pub fn node(&self) -> &ServerNode {
        &self.node
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.service.has_method(method)
    }

    pub async fn invoke(&mut self, method: &str, args: Value) -> Result<Value> {
        if !self.has_method(method) {
            return Err(WrpcErr::unknown_method(self.service.name(), method));
        }
        self.channel.invoke(self.service.name(), method, args).await
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    pub fn close(&mut self) {
        self.channel.close();
    }
}

/// 连接工厂：选节点、打开传输、按服务名包装
pub struct ConnectionFactory {
    provider: Arc<dyn Provider>,
    transport: Arc<dyn Transport>,
    services: HashMap<String, ServiceDescriptor>,
}

impl ConnectionFactory {
    /// 服务里有实验性质的描述时返回 `NotSupported`
    pub fn new(provider: Arc<dyn Provider>, transport: Arc<dyn Transport>) -> Result<Self> {
        let mut services = HashMap::new();
        for service in provider.get_services() {
            if service.is_unchecked() {
                return Err(WrpcErr::not_supported(format!(
                    "service `{}` is marked unchecked",
                    service.name()
                )));
            }
            services.insert(service.name().to_string(), service);
        }

        Ok(Self {
            provider,
            transport,
            services,
        })
    }

    pub fn service(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.get(name)
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }
}

#[async_trait]
impl PoolFactory for ConnectionFactory {
    type Object = RpcConnection;

    async fn create(&self, key: &str) -> Result<RpcConnection> {
        let service = self
            .services
            .get(key)
            .cloned()
            .ok_or_else(|| WrpcErr::not_found_service(key))?;
        let node = self.provider.select()?;

        let channel = self
            .transport
            .open(node.address(), node.port())
            .await
            .map_err(|e| match e {
                WrpcErr::ConnectionError(_) => e,
                other => WrpcErr::connection_error(other.to_string()),
            })?;
        log::debug!("Created connection for {} to {}", key, node.host_port());

        Ok(RpcConnection::new(service, node, channel))
    }

    fn is_valid(&self, object: &RpcConnection) -> bool {
        object.is_open()
    }

    fn close(&self, key: &str, mut object: RpcConnection) {
        log::debug!("Closing connection for {} to {}", key, object.node().host_port());
        object.close();
    }
}
