use super::{join_path, ChildrenListener, Coordinator, SessionListener, SessionState};
use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, GetOptions, PutOptions, Txn, TxnOp,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use wrpc_core::config::namespace_root;
use wrpc_core::{Result, WrpcConfig, WrpcErr};

#[derive(Debug, Clone)]
pub struct EtcdConfig {
    /// 逗号分隔的地址列表，没有协议前缀时按 `http://` 处理
    pub addr: String,
    pub timeout: Duration,
    pub namespace: String,
    /// 临时节点租约时长
    pub ttl: Duration,
    /// 子节点轮询间隔
    pub poll_interval: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            addr: "http://127.0.0.1:2379".to_string(),
            timeout: Duration::from_secs(8),
            namespace: String::new(),
            ttl: Duration::from_secs(10),
            poll_interval: Duration::from_secs(3),
            username: None,
            password: None,
        }
    }
}

/// 沿用 `WrpcConfig` 的注册中心地址、超时和命名空间
impl From<&WrpcConfig> for EtcdConfig {
    fn from(config: &WrpcConfig) -> Self {
        Self {
            addr: config.zk_hosts.clone(),
            timeout: config.zk_timeout,
            namespace: config.namespace.clone(),
            ..Default::default()
        }
    }
}

impl EtcdConfig {
    pub fn endpoints(&self) -> Vec<String> {
        self.addr
            .split(',')
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .map(|host| {
                if host.contains("://") {
                    host.to_string()
                } else {
                    format!("http://{}", host)
                }
            })
            .collect()
    }

    pub fn with_auth(mut self, username: String, password: String) -> Self {
        self.username = Some(username);
        self.password = Some(password);
        self
    }

    async fn create_client(&self) -> Result<Client> {
        let mut options = ConnectOptions::new().with_timeout(self.timeout);
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            options = options.with_user(username, password);
        }
        let endpoints = self.endpoints();
        if endpoints.is_empty() {
            return Err(WrpcErr::invalid_config("etcd address is empty"));
        }
        Client::connect(endpoints, Some(options))
            .await
            .map_err(etcd_err)
    }
}

fn etcd_err(err: etcd_client::Error) -> WrpcErr {
    WrpcErr::coordination_error(err.to_string())
}

/// 基于 etcd 的注册中心客户端
///
/// 临时节点挂在一个租约上，后台任务负责续约；租约失效时通知 `Lost`，
/// 重新申请到租约后通知 `Connected`。
#[derive(Clone)]
pub struct EtcdCoordinator {
    inner: Arc<EtcdInner>,
}

struct EtcdInner {
    client: Client,
    config: EtcdConfig,
    root: String,
    lease_id: Mutex<i64>,
    listeners: Mutex<Vec<Arc<dyn SessionListener>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl EtcdCoordinator {
    pub async fn from_config(config: &WrpcConfig) -> Result<Self> {
        Self::connect(EtcdConfig::from(config)).await
    }

    pub async fn connect(config: EtcdConfig) -> Result<Self> {
        let mut client = config.create_client().await?;
        let lease = client
            .lease_grant(config.ttl.as_secs().max(1) as i64, None)
            .await
            .map_err(etcd_err)?;
        log::info!("Connected to etcd {} with lease {}", config.addr, lease.id());

        let inner = Arc::new(EtcdInner {
            client,
            root: namespace_root(&config.namespace),
            config,
            lease_id: Mutex::new(lease.id()),
            listeners: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let keeper = tokio::spawn(keep_alive_loop(inner.clone()));
        inner.tasks.lock().push(keeper);
        Ok(Self { inner })
    }

    fn full_path(&self, path: &str) -> String {
        join_path(&self.inner.root, path)
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(WrpcErr::coordination_error("client is closed"));
        }
        Ok(())
    }
}

impl EtcdInner {
    async fn emit(&self, state: SessionState) {
        let listeners: Vec<Arc<dyn SessionListener>> = self.listeners.lock().clone();
        for listener in listeners {
            listener.on_state(state).await;
        }
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/", path);
        let resp = self
            .client
            .clone()
            .get(prefix.clone(), Some(GetOptions::new().with_prefix().with_keys_only()))
            .await
            .map_err(etcd_err)?;

        let mut children: Vec<String> = resp
            .kvs()
            .iter()
            .filter_map(|kv| kv.key_str().ok())
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect();
        children.sort();
        Ok(children)
    }
}

async fn keep_alive_loop(inner: Arc<EtcdInner>) {
    let ttl = inner.config.ttl.as_secs().max(1) as i64;
    let period = (inner.config.ttl / 3).max(Duration::from_millis(500));
    let mut client = inner.client.clone();

    loop {
        let lease_id = *inner.lease_id.lock();
        let alive = match client.lease_keep_alive(lease_id).await {
            Ok((mut keeper, mut stream)) => loop {
                tokio::time::sleep(period).await;
                if let Err(e) = keeper.keep_alive().await {
                    log::error!("Failed to refresh etcd lease {}: {}", lease_id, e);
                    break false;
                }
                match stream.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => continue,
                    Ok(_) => break false,
                    Err(e) => {
                        log::error!("Lease {} keep alive stream failed: {}", lease_id, e);
                        break false;
                    }
                }
            },
            Err(e) => {
                log::error!("Failed to keep etcd lease {} alive: {}", lease_id, e);
                false
            }
        };

        if alive || inner.closed.load(Ordering::SeqCst) {
            return;
        }
        inner.emit(SessionState::Lost).await;

        // 重新申请租约，成功即视为会话恢复
        loop {
            if inner.closed.load(Ordering::SeqCst) {
                return;
            }
            match client.lease_grant(ttl, None).await {
                Ok(lease) => {
                    *inner.lease_id.lock() = lease.id();
                    log::info!("Etcd lease re-granted: {}", lease.id());
                    break;
                }
                Err(e) => {
                    log::warn!("Failed to re-grant etcd lease: {}", e);
                    inner.emit(SessionState::Suspended).await;
                    tokio::time::sleep(period).await;
                }
            }
        }
        inner.emit(SessionState::Connected).await;
    }
}

#[async_trait]
impl Coordinator for EtcdCoordinator {
    async fn ensure_path(&self, path: &str) -> Result<()> {
        self.check_open()?;
        let full = self.full_path(path);
        let mut client = self.inner.client.clone();

        let mut current = String::new();
        for segment in full.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            let txn = Txn::new()
                .when([Compare::version(current.clone(), CompareOp::Equal, 0)])
                .and_then([TxnOp::put(current.clone(), "", None)]);
            client.txn(txn).await.map_err(etcd_err)?;
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.check_open()?;
        let resp = self
            .inner
            .client
            .clone()
            .get(self.full_path(path), Some(GetOptions::new().with_count_only()))
            .await
            .map_err(etcd_err)?;
        Ok(resp.count() > 0)
    }

    async fn create(&self, path: &str, ephemeral: bool) -> Result<()> {
        self.check_open()?;
        let full = self.full_path(path);
        let options = if ephemeral {
            Some(PutOptions::new().with_lease(*self.inner.lease_id.lock()))
        } else {
            None
        };

        let txn = Txn::new()
            .when([Compare::version(full.clone(), CompareOp::Equal, 0)])
            .and_then([TxnOp::put(full.clone(), "", options)]);
        let resp = self.inner.client.clone().txn(txn).await.map_err(etcd_err)?;
        if !resp.succeeded() {
            return Err(WrpcErr::NodeExists(full));
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check_open()?;
        let full = self.full_path(path);
        let resp = self
            .inner
            .client
            .clone()
            .delete(full.clone(), None)
            .await
            .map_err(etcd_err)?;
        if resp.deleted() == 0 {
            return Err(WrpcErr::NoNode(full));
        }
        Ok(())
    }

    async fn children_watch(&self, path: &str, listener: Arc<dyn ChildrenListener>) -> Result<()> {
        self.check_open()?;
        let full = self.full_path(path);
        let inner = self.inner.clone();

        let initial = inner.children(&full).await?;
        listener.on_children(initial.clone()).await;

        let task = tokio::spawn(async move {
            let mut last = initial;
            let mut interval = tokio::time::interval(inner.config.poll_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                match inner.children(&full).await {
                    Ok(children) if children != last => {
                        last = children.clone();
                        listener.on_children(children).await;
                    }
                    Ok(_) => {}
                    Err(e) => log::error!("Failed to sync children of {}: {}", full, e),
                }
            }
        });
        self.inner.tasks.lock().push(task);
        Ok(())
    }

    async fn add_session_listener(&self, listener: Arc<dyn SessionListener>) {
        self.inner.listeners.lock().push(listener);
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }

        let lease_id = *self.inner.lease_id.lock();
        if let Err(e) = self.inner.client.clone().lease_revoke(lease_id).await {
            log::warn!("Failed to revoke etcd lease {}: {}", lease_id, e);
        }
        log::info!("Etcd coordinator closed");
    }
}
