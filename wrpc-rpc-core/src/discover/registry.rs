use crate::coordination::{Coordinator, SessionListener, SessionState};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use wrpc_core::{FixedIpResolver, IpResolver, LocalIpResolver, Result, ServerConfig, WrpcErr};

/// 注册状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrarState {
    Unregistered,
    /// 已请求注册但还没成功，会话重新连上时重试
    Pending,
    Registered,
    /// 会话丢失，等待重新连上后再注册
    Lost,
    Closed,
}

/// 服务端注册器
///
/// 以临时节点 `/{global_service}/{version}/{ip}:{port}:{weight}` 注册本进程，
/// 会话重新连上时自动补注册。
#[derive(Clone)]
pub struct Registrar {
    core: Arc<RegistrarCore>,
}

struct RegistrarCore {
    coordinator: Arc<dyn Coordinator>,
    config: ServerConfig,
    resolver: Arc<dyn IpResolver>,
    state: Mutex<RegistrarState>,
    path: Mutex<Option<String>>,
    // 串行化注册、注销和关闭
    attempt: tokio::sync::Mutex<()>,
    listening: AtomicBool,
}

impl Registrar {
    /// 配置了 `ip` 时固定使用它，否则每次注册都重新解析本机 IP
    pub fn new(coordinator: Arc<dyn Coordinator>, config: ServerConfig) -> Self {
        let resolver: Arc<dyn IpResolver> = match &config.ip {
            Some(ip) => Arc::new(FixedIpResolver::new(ip.clone())),
            None => Arc::new(LocalIpResolver),
        };
        Self::with_resolver(coordinator, config, resolver)
    }

    pub fn with_resolver(
        coordinator: Arc<dyn Coordinator>,
        config: ServerConfig,
        resolver: Arc<dyn IpResolver>,
    ) -> Self {
        Self {
            core: Arc::new(RegistrarCore {
                coordinator,
                config,
                resolver,
                state: Mutex::new(RegistrarState::Unregistered),
                path: Mutex::new(None),
                attempt: tokio::sync::Mutex::new(()),
                listening: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> RegistrarState {
        *self.core.state.lock()
    }

    /// 当前注册的节点路径
    pub fn registered_path(&self) -> Option<String> {
        self.core.path.lock().clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.core.config
    }

    /// 先监听会话状态，再注册一次
    ///
    /// 首次注册失败时返回错误，但监听已经装上，状态停在 `Pending`，
    /// 会话重新连上后继续补注册。
    pub async fn register_and_listen(&self) -> Result<String> {
        if !self.core.listening.swap(true, Ordering::SeqCst) {
            let listener = RegistrarListener {
                core: Arc::downgrade(&self.core),
            };
            self.core
                .coordinator
                .add_session_listener(Arc::new(listener))
                .await;
        }

        self.core.register().await.map_err(|e| {
            log::warn!("Initial registration failed, retry on reconnect: {}", e);
            e
        })
    }

    /// 注册一次，返回注册的路径
    pub async fn register(&self) -> Result<String> {
        self.core.register().await
    }

    /// 主动删除注册节点
    pub async fn deregister(&self) -> Result<()> {
        let _guard = self.core.attempt.lock().await;
        let path = self.core.path.lock().take();
        if let Some(path) = path {
            self.core.delete_benign(&path).await?;
            log::info!("Server deregistered: {}", path);
        }

        let mut state = self.core.state.lock();
        if *state != RegistrarState::Closed {
            *state = RegistrarState::Unregistered;
        }
        Ok(())
    }

    /// 关闭注册中心客户端，临时节点随会话一起删除
    pub async fn close(&self) {
        let _guard = self.core.attempt.lock().await;
        *self.core.state.lock() = RegistrarState::Closed;
        self.core.coordinator.close().await;
        log::info!("Registrar closed");
    }
}

impl RegistrarCore {
    async fn register(&self) -> Result<String> {
        let _guard = self.attempt.lock().await;
        self.register_locked().await
    }

    /// 重连时补注册，注销或关闭之后什么都不做
    async fn re_register(&self) -> Result<Option<String>> {
        let _guard = self.attempt.lock().await;
        if !self.wants_registration() {
            return Ok(None);
        }
        self.register_locked().await.map(Some)
    }

    async fn register_locked(&self) -> Result<String> {
        if *self.state.lock() == RegistrarState::Closed {
            return Err(WrpcErr::invalid_state("registrar is closed"));
        }

        match self.try_register().await {
            Ok(path) => {
                *self.path.lock() = Some(path.clone());
                *self.state.lock() = RegistrarState::Registered;
                Ok(path)
            }
            Err(e) => {
                let mut state = self.state.lock();
                if *state != RegistrarState::Closed {
                    *state = RegistrarState::Pending;
                }
                Err(e)
            }
        }
    }

    async fn try_register(&self) -> Result<String> {
        self.coordinator
            .ensure_path(&self.config.parent_path())
            .await?;

        let ip = self.resolver.resolve()?;
        let path = self.config.path(&ip);

        let previous = self.path.lock().clone();
        if let Some(old) = previous.filter(|old| *old != path) {
            log::info!("Server ip changed, remove old node: {}", old);
            self.delete_benign(&old).await?;
        }

        if !self.coordinator.exists(&path).await? {
            match self.coordinator.create(&path, true).await {
                Ok(()) => log::info!("Server registered: {}", path),
                Err(WrpcErr::NodeExists(_)) => log::debug!("Server node already exists: {}", path),
                Err(e) => return Err(e),
            }
        } else {
            log::debug!("Server node already exists: {}", path);
        }
        Ok(path)
    }

    fn wants_registration(&self) -> bool {
        matches!(
            *self.state.lock(),
            RegistrarState::Pending | RegistrarState::Registered | RegistrarState::Lost
        )
    }

    async fn delete_benign(&self, path: &str) -> Result<()> {
        match self.coordinator.delete(path).await {
            Ok(()) | Err(WrpcErr::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

struct RegistrarListener {
    core: Weak<RegistrarCore>,
}

#[async_trait]
impl SessionListener for RegistrarListener {
    async fn on_state(&self, state: SessionState) {
        let Some(core) = self.core.upgrade() else {
            return;
        };

        match state {
            SessionState::Connected => match core.re_register().await {
                Ok(Some(path)) => {
                    log::info!("Coordination session connected, registered again: {}", path)
                }
                Ok(None) => log::debug!("Coordination session connected, registrar is idle"),
                Err(e) => log::error!("Failed to register server: {}", e),
            },
            SessionState::Lost => {
                log::warn!("Coordination session lost");
                let mut current = core.state.lock();
                if *current == RegistrarState::Registered {
                    *current = RegistrarState::Lost;
                }
            }
            SessionState::Suspended => {
                log::info!("Coordination session suspended");
            }
        }
    }
}
