use crate::error::{Result, WrpcErr};
use crate::node::check_hosts;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8603;
pub const DEFAULT_VERSION: &str = "1.0.0";
pub const DEFAULT_WEIGHT: u32 = 1;
/// 权重上限，选择列表按权重展开，超出的节点按格式错误处理
pub const MAX_WEIGHT: u32 = 100;
pub const DEFAULT_GLOBAL_SERVICE: &str = "com.wrpc.service";

/// 注册中心根路径前缀
pub const ZK_ROOT: &str = "wrpc";
pub const ZK_SEPARATOR: &str = "/";

const DEFAULT_ZK_HOSTS: &str = "127.0.0.1:2181";
const DEFAULT_ZK_TIMEOUT: Duration = Duration::from_secs(8);
const DEFAULT_RETRY: u32 = 3;
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(200);
const DEFAULT_POOL_MAX_SIZE: usize = 8;
const DEFAULT_POOL_MAX_ACTIVE_SIZE: usize = 4;

/// 负载均衡策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[default]
    RoundRobin,
    Random,
}

/// 注册中心命名空间根路径：`/wrpc` 或 `/wrpc/{namespace}`
pub fn namespace_root(namespace: &str) -> String {
    let namespace = namespace.trim_matches('/');
    if namespace.is_empty() {
        format!("{}{}", ZK_SEPARATOR, ZK_ROOT)
    } else {
        format!("{}{}{}{}", ZK_SEPARATOR, ZK_ROOT, ZK_SEPARATOR, namespace)
    }
}

/// 服务目录 `/{global_service}/{version}`，全局服务名为空时为 `/{version}`
pub fn service_parent_path(global_service: &str, version: &str) -> String {
    if global_service.is_empty() {
        format!("{}{}", ZK_SEPARATOR, version)
    } else {
        format!("{}{}{}{}", ZK_SEPARATOR, global_service, ZK_SEPARATOR, version)
    }
}

/// wrpc 配置
///
/// 配置文件里的时长统一按秒填写，例如 `"retry_interval": 0.2`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WrpcConfig {
    pub zk_hosts: String,
    #[serde(with = "secs")]
    pub zk_timeout: Duration,
    pub namespace: String,
    pub global_service: String,
    pub version: String,
    pub port: u16,
    pub weight: u32,
    /// 强制指定注册 IP，为空时每次注册都重新解析本机 IP
    pub ip: Option<String>,
    /// 静态模式下的服务地址 `ip:port[:weight]`，逗号分隔
    pub server_address: String,
    pub load_balance: LoadBalanceStrategy,
    pub retry: u32,
    #[serde(with = "secs")]
    pub retry_interval: Duration,
    /// 业务异常是否也销毁连接并重试
    pub retry_on_remote_error: bool,
    /// 整个调用（含所有重试）的截止时间
    #[serde(with = "opt_secs")]
    pub call_timeout: Option<Duration>,
    pub pool_max_size: usize,
    pub pool_max_active_size: usize,
    #[serde(with = "opt_secs")]
    pub pool_wait_timeout: Option<Duration>,
}

impl Default for WrpcConfig {
    fn default() -> Self {
        Self {
            zk_hosts: DEFAULT_ZK_HOSTS.to_string(),
            zk_timeout: DEFAULT_ZK_TIMEOUT,
            namespace: String::new(),
            global_service: DEFAULT_GLOBAL_SERVICE.to_string(),
            version: DEFAULT_VERSION.to_string(),
            port: DEFAULT_PORT,
            weight: DEFAULT_WEIGHT,
            ip: None,
            server_address: String::new(),
            load_balance: LoadBalanceStrategy::default(),
            retry: DEFAULT_RETRY,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            retry_on_remote_error: true,
            call_timeout: None,
            pool_max_size: DEFAULT_POOL_MAX_SIZE,
            pool_max_active_size: DEFAULT_POOL_MAX_ACTIVE_SIZE,
            pool_wait_timeout: None,
        }
    }
}

impl WrpcConfig {
    pub fn builder() -> WrpcConfigBuilder {
        WrpcConfigBuilder::new()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: WrpcConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry == 0 {
            return Err(WrpcErr::invalid_config("retry must be at least 1"));
        }
        if self.pool_max_size == 0 {
            return Err(WrpcErr::invalid_config("pool_max_size must be at least 1"));
        }
        if self.pool_max_active_size > self.pool_max_size {
            return Err(WrpcErr::invalid_config(format!(
                "pool_max_active_size ({}) exceeds pool_max_size ({})",
                self.pool_max_active_size, self.pool_max_size
            )));
        }
        if self.weight > MAX_WEIGHT {
            return Err(WrpcErr::invalid_config(format!(
                "weight ({}) exceeds {}",
                self.weight, MAX_WEIGHT
            )));
        }
        if self.version.is_empty() {
            return Err(WrpcErr::invalid_config("version must not be empty"));
        }
        if !self.server_address.is_empty() && !check_hosts(&self.server_address) {
            return Err(WrpcErr::InvalidAddressConfig(self.server_address.clone()));
        }
        Ok(())
    }

    /// 注册中心根路径
    pub fn namespace_root(&self) -> String {
        namespace_root(&self.namespace)
    }

    pub fn parent_path(&self) -> String {
        service_parent_path(&self.global_service, &self.version)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_size: self.pool_max_size,
            max_active_size: self.pool_max_active_size,
            wait_timeout: self.pool_wait_timeout,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry: self.retry,
            retry_interval: self.retry_interval,
            retry_on_remote_error: self.retry_on_remote_error,
            call_timeout: self.call_timeout,
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            global_service: self.global_service.clone(),
            version: self.version.clone(),
            port: self.port,
            weight: self.weight,
            ip: self.ip.clone(),
        }
    }
}

/// 连接池配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// 每个 key 最多同时创建的连接数
    pub max_size: usize,
    /// 每个 key 最多保留的空闲连接数
    pub max_active_size: usize,
    /// 借出等待时间，`None` 表示一直等待
    pub wait_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_POOL_MAX_SIZE,
            max_active_size: DEFAULT_POOL_MAX_ACTIVE_SIZE,
            wait_timeout: None,
        }
    }
}

/// 重试策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry: u32,
    pub retry_interval: Duration,
    pub retry_on_remote_error: bool,
    pub call_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry: DEFAULT_RETRY,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            retry_on_remote_error: true,
            call_timeout: None,
        }
    }
}

/// 服务端注册配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub global_service: String,
    pub version: String,
    pub port: u16,
    pub weight: u32,
    pub ip: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            global_service: DEFAULT_GLOBAL_SERVICE.to_string(),
            version: DEFAULT_VERSION.to_string(),
            port: DEFAULT_PORT,
            weight: DEFAULT_WEIGHT,
            ip: None,
        }
    }
}

impl ServerConfig {
    pub fn parent_path(&self) -> String {
        service_parent_path(&self.global_service, &self.version)
    }

    pub fn node_name(&self, ip: &str) -> String {
        format!("{}:{}:{}", ip, self.port, self.weight)
    }

    pub fn path(&self, ip: &str) -> String {
        format!("{}{}{}", self.parent_path(), ZK_SEPARATOR, self.node_name(ip))
    }
}

/// 配置构建器
pub struct WrpcConfigBuilder {
    config: WrpcConfig,
}

impl WrpcConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: WrpcConfig::default(),
        }
    }

    /// 设置注册中心地址
    pub fn zk_hosts(mut self, hosts: impl Into<String>) -> Self {
        self.config.zk_hosts = hosts.into();
        self
    }

    pub fn zk_timeout(mut self, timeout: Duration) -> Self {
        self.config.zk_timeout = timeout;
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    /// 设置全局服务名
    pub fn global_service(mut self, name: impl Into<String>) -> Self {
        self.config.global_service = name.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.config.version = version.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.config.weight = weight;
        self
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.config.ip = Some(ip.into());
        self
    }

    /// 设置静态服务地址
    pub fn server_address(mut self, address: impl Into<String>) -> Self {
        self.config.server_address = address.into();
        self
    }

    pub fn load_balance(mut self, strategy: LoadBalanceStrategy) -> Self {
        self.config.load_balance = strategy;
        self
    }

    /// 设置重试次数
    pub fn retry(mut self, retry: u32) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.config.retry_interval = interval;
        self
    }

    pub fn retry_on_remote_error(mut self, enabled: bool) -> Self {
        self.config.retry_on_remote_error = enabled;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = Some(timeout);
        self
    }

    /// 设置连接池上限
    pub fn pool_max_size(mut self, size: usize) -> Self {
        self.config.pool_max_size = size;
        self
    }

    pub fn pool_max_active_size(mut self, size: usize) -> Self {
        self.config.pool_max_active_size = size;
        self
    }

    pub fn pool_wait_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool_wait_timeout = Some(timeout);
        self
    }

    /// 构建并校验配置
    pub fn build(self) -> Result<WrpcConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for WrpcConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        match Option::<f64>::deserialize(deserializer)? {
            Some(secs) => Duration::try_from_secs_f64(secs)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
