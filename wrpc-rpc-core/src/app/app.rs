use super::server::{Server, ServiceHandler};
use crate::coordination::Coordinator;
use crate::discover::Registrar;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use wrpc_core::{ErrorCode, IpResolver, Result, ServerConfig, WrpcConfig, WrpcErr};

/// RPC 应用程序
pub struct App {
    /// 注册配置
    pub config: ServerConfig,
    bind_ip: String,
    server: Server,
    coordinator: Option<Arc<dyn Coordinator>>,
    resolver: Option<Arc<dyn IpResolver>>,
}

impl App {
    /// 创建新的 Builder
    pub fn builder() -> AppBuilder {
        AppBuilder::new()
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    /// 启动服务并注册
    ///
    /// 注册使用实际绑定的端口，配置端口为 0 时由系统分配。
    /// 注册中心暂时不可用时服务照常启动，会话重新连上后补注册。
    pub async fn start(self) -> Result<RunningApp> {
        let listener = TcpListener::bind((self.bind_ip.as_str(), self.config.port)).await?;
        let local_addr = listener.local_addr()?;

        let mut config = self.config;
        config.port = local_addr.port();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = self.server.clone();
        let server_task = tokio::spawn(async move {
            if let Err(e) = server.serve(listener, shutdown_rx).await {
                log::error!("Server stopped with error: {}", e);
            }
        });

        let registrar = match self.coordinator {
            Some(coordinator) => {
                let registrar = match self.resolver {
                    Some(resolver) => Registrar::with_resolver(coordinator, config.clone(), resolver),
                    None => Registrar::new(coordinator, config.clone()),
                };
                match registrar.register_and_listen().await {
                    Ok(_) => {}
                    Err(e) if matches!(e.code(), ErrorCode::CoordinationError | ErrorCode::Timeout) => {
                        log::warn!("Server started unregistered, waiting for coordinator: {}", e);
                    }
                    Err(e) => {
                        log::error!("Failed to register server: {}", e);
                        let _ = shutdown_tx.send(true);
                        let _ = server_task.await;
                        return Err(e);
                    }
                }
                Some(registrar)
            }
            None => {
                log::info!("No coordinator configured, server runs without registration");
                None
            }
        };

        log::info!("Server started at: {}", local_addr);
        Ok(RunningApp {
            config,
            local_addr,
            registrar,
            shutdown_tx,
            server_task,
        })
    }

    /// 启动后等待 Ctrl-C 或 SIGTERM，然后优雅退出
    pub async fn run(self) -> Result<()> {
        let running = self.start().await?;
        wait_for_signal().await?;
        log::info!("Shutting down gracefully...");
        running.shutdown().await;
        Ok(())
    }
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = term.recv() => {},
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}

/// 运行中的应用
pub struct RunningApp {
    config: ServerConfig,
    local_addr: SocketAddr,
    registrar: Option<Registrar>,
    shutdown_tx: watch::Sender<bool>,
    server_task: JoinHandle<()>,
}

impl RunningApp {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registrar(&self) -> Option<&Registrar> {
        self.registrar.as_ref()
    }

    /// 注销、关闭注册中心客户端、停止接收连接
    pub async fn shutdown(self) {
        if let Some(registrar) = &self.registrar {
            if let Err(e) = registrar.deregister().await {
                log::error!("Failed to deregister server: {}", e);
            }
            registrar.close().await;
        }

        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.server_task.await {
            log::error!("Server task failed: {}", e);
        }
        log::info!("Server at {} shut down", self.local_addr);
    }
}

/// App Builder
pub struct AppBuilder {
    config: ServerConfig,
    bind_ip: String,
    services: Vec<Arc<dyn ServiceHandler>>,
    coordinator: Option<Arc<dyn Coordinator>>,
    resolver: Option<Arc<dyn IpResolver>>,
}

impl AppBuilder {
    /// 创建新的 Builder
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            bind_ip: "0.0.0.0".to_string(),
            services: Vec::new(),
            coordinator: None,
            resolver: None,
        }
    }

    /// 使用 wrpc 配置里的注册参数
    pub fn with_config(mut self, config: &WrpcConfig) -> Self {
        self.config = config.server_config();
        self
    }

    pub fn server_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// 设置监听地址
    pub fn bind_ip(mut self, ip: impl Into<String>) -> Self {
        self.bind_ip = ip.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// 设置权重
    pub fn weight(mut self, weight: u32) -> Self {
        self.config.weight = weight;
        self
    }

    /// 添加服务
    pub fn service(mut self, handler: Arc<dyn ServiceHandler>) -> Self {
        self.services.push(handler);
        self
    }

    /// 设置注册中心
    pub fn coordinator(mut self, coordinator: Arc<dyn Coordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn ip_resolver(mut self, resolver: Arc<dyn IpResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// 构建 App 实例
    pub fn build(self) -> Result<App> {
        if self.services.is_empty() {
            return Err(WrpcErr::invalid_config("at least one service is required"));
        }

        let server = Server::new();
        for handler in self.services {
            server.add_service(handler);
        }

        Ok(App {
            config: self.config,
            bind_ip: self.bind_ip,
            server,
            coordinator: self.coordinator,
            resolver: self.resolver,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::FnService;
    use crate::coordination::testing::FlakyCoordinator;
    use crate::coordination::MemoryEnsemble;
    use crate::discover::RegistrarState;
    use crate::service::ServiceDescriptor;
    use wrpc_core::FixedIpResolver;

    fn echo() -> Arc<dyn ServiceHandler> {
        Arc::new(FnService::new(ServiceDescriptor::open("Echo"), |_, args| Ok(args)))
    }

    #[test]
    fn test_build_requires_service() {
        assert!(matches!(
            App::builder().build(),
            Err(WrpcErr::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_start_registers_bound_port() {
        let ensemble = MemoryEnsemble::new();
        let app = App::builder()
            .server_config(ServerConfig {
                global_service: "com.demo.service".to_string(),
                ..Default::default()
            })
            .bind_ip("127.0.0.1")
            .port(0)
            .service(echo())
            .coordinator(Arc::new(ensemble.connect("")))
            .ip_resolver(Arc::new(FixedIpResolver::new("127.0.0.1")))
            .build()
            .unwrap();

        let running = app.start().await.unwrap();
        let port = running.local_addr().port();
        assert_ne!(port, 0);
        assert_eq!(
            ensemble.children("/wrpc/com.demo.service/1.0.0"),
            vec![format!("127.0.0.1:{}:1", port)]
        );
        assert_eq!(
            running.registrar().unwrap().registered_path(),
            Some(format!("/com.demo.service/1.0.0/127.0.0.1:{}:1", port))
        );

        running.shutdown().await;
        assert!(ensemble.children("/wrpc/com.demo.service/1.0.0").is_empty());
    }

    #[tokio::test]
    async fn test_start_survives_unavailable_coordinator() {
        let ensemble = MemoryEnsemble::new();
        let coordinator = ensemble.connect("");
        let client_id = coordinator.client_id();
        let app = App::builder()
            .server_config(ServerConfig {
                global_service: "com.demo.service".to_string(),
                ..Default::default()
            })
            .bind_ip("127.0.0.1")
            .port(0)
            .service(echo())
            .coordinator(Arc::new(FlakyCoordinator::new(coordinator, 1)))
            .ip_resolver(Arc::new(FixedIpResolver::new("127.0.0.1")))
            .build()
            .unwrap();

        let running = app.start().await.unwrap();
        let registrar = running.registrar().unwrap().clone();
        assert_eq!(registrar.state(), RegistrarState::Pending);
        assert!(ensemble.children("/wrpc/com.demo.service/1.0.0").is_empty());

        ensemble.expire_session(client_id);
        for _ in 0..100 {
            if registrar.state() == RegistrarState::Registered {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let port = running.local_addr().port();
        assert_eq!(
            ensemble.children("/wrpc/com.demo.service/1.0.0"),
            vec![format!("127.0.0.1:{}:1", port)]
        );

        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_without_coordinator() {
        let app = App::builder()
            .bind_ip("127.0.0.1")
            .port(0)
            .service(echo())
            .build()
            .unwrap();
        let running = app.start().await.unwrap();
        assert!(running.registrar().is_none());
        running.shutdown().await;
    }
}
