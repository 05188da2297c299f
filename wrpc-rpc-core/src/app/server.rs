use crate::service::ServiceDescriptor;
use crate::transport::codec::{decode, read_frame, write_frame, RpcRequest, RpcResponse};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use wrpc_core::{Result, WrpcErr};

/// 服务实现
#[async_trait]
pub trait ServiceHandler: Send + Sync + 'static {
    fn descriptor(&self) -> ServiceDescriptor;

    async fn handle(&self, method: &str, args: Value) -> Result<Value>;
}

/// 用闭包实现的服务
pub struct FnService<F> {
    descriptor: ServiceDescriptor,
    f: F,
}

impl<F> FnService<F>
where
    F: Fn(&str, Value) -> Result<Value> + Send + Sync + 'static,
{
    pub fn new(descriptor: ServiceDescriptor, f: F) -> Self {
        Self { descriptor, f }
    }
}

#[async_trait]
impl<F> ServiceHandler for FnService<F>
where
    F: Fn(&str, Value) -> Result<Value> + Send + Sync + 'static,
{
    fn descriptor(&self) -> ServiceDescriptor {
        self.descriptor.clone()
    }

    async fn handle(&self, method: &str, args: Value) -> Result<Value> {
        (self.f)(method, args)
    }
}

/// TCP 服务端，按服务名分发请求
#[derive(Clone, Default)]
pub struct Server {
    handlers: Arc<DashMap<String, Arc<dyn ServiceHandler>>>,
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_service(&self, handler: Arc<dyn ServiceHandler>) {
        let name = handler.descriptor().name().to_string();
        log::info!("Service added: {}", name);
        self.handlers.insert(name, handler);
    }

    pub fn services(&self) -> Vec<String> {
        self.handlers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// 处理一个请求
    pub async fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        let handler = self
            .handlers
            .get(&request.service)
            .map(|entry| entry.value().clone());

        let outcome = match handler {
            None => Err(WrpcErr::not_found_service(request.service.clone())),
            Some(handler) if !handler.descriptor().has_method(&request.method) => {
                Err(WrpcErr::unknown_method(&request.service, &request.method))
            }
            Some(handler) => handler.handle(&request.method, request.args).await,
        };

        match outcome {
            Ok(result) => RpcResponse::success(request.id, result),
            Err(e) => {
                log::debug!("Request {}.{} failed: {}", request.service, request.method, e);
                RpcResponse::failure(request.id, &e)
            }
        }
    }

    /// 接收连接直到收到关闭信号
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let local = listener.local_addr()?;
        log::info!("Server listening on {}", local);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = self.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                server.handle_connection(stream, peer, shutdown).await;
                            });
                        }
                        Err(e) => log::error!("Failed to accept connection: {}", e),
                    }
                }
            }
        }

        log::info!("Server on {} stopped", local);
        Ok(())
    }

    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) {
        log::debug!("Connection accepted from {}", peer);
        loop {
            let frame = tokio::select! {
                _ = shutdown.changed() => break,
                frame = read_frame(&mut stream) => frame,
            };

            let body = match frame {
                Ok(Some(body)) => body,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Failed to read frame from {}: {}", peer, e);
                    break;
                }
            };

            let response = match decode::<RpcRequest>(&body) {
                Ok(request) => self.dispatch(request).await,
                Err(e) => {
                    log::warn!("Malformed request from {}: {}", peer, e);
                    RpcResponse::failure(0, &e)
                }
            };

            if let Err(e) = write_frame(&mut stream, &response).await {
                log::warn!("Failed to write response to {}: {}", peer, e);
                break;
            }
        }
        log::debug!("Connection from {} closed", peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wrpc_core::ErrorCode;

    fn echo_server() -> Server {
        let server = Server::new();
        server.add_service(Arc::new(FnService::new(
            ServiceDescriptor::new("Echo", ["echo", "fail"]),
            |method, args| match method {
                "fail" => Err(WrpcErr::remote_error("failed on purpose")),
                _ => Ok(args),
            },
        )));
        server
    }

    fn request(service: &str, method: &str) -> RpcRequest {
        RpcRequest {
            id: 1,
            service: service.to_string(),
            method: method.to_string(),
            args: json!("payload"),
        }
    }

    fn code(response: &RpcResponse) -> ErrorCode {
        ErrorCode::from_i32(response.error.as_ref().unwrap().code)
    }

    #[tokio::test]
    async fn test_dispatch() {
        let server = echo_server();
        assert_eq!(server.services(), vec!["Echo".to_string()]);

        let ok = server.dispatch(request("Echo", "echo")).await;
        assert_eq!(ok.result, Some(json!("payload")));

        let failed = server.dispatch(request("Echo", "fail")).await;
        assert_eq!(code(&failed), ErrorCode::RemoteError);

        let unknown = server.dispatch(request("Echo", "nope")).await;
        assert_eq!(code(&unknown), ErrorCode::UnknownMethod);

        let missing = server.dispatch(request("Missing", "echo")).await;
        assert_eq!(code(&missing), ErrorCode::ServiceNotFound);
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_codec_error() {
        let server = echo_server();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let server = server.clone();
            async move { server.serve(listener, rx).await }
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut stream, &json!("not a request")).await.unwrap();
        let body = read_frame(&mut stream).await.unwrap().unwrap();
        let response: RpcResponse = decode(&body).unwrap();
        assert_eq!(code(&response), ErrorCode::CodecError);

        // 连接仍然可用
        write_frame(&mut stream, &request("Echo", "echo")).await.unwrap();
        let body = read_frame(&mut stream).await.unwrap().unwrap();
        let response: RpcResponse = decode(&body).unwrap();
        assert_eq!(response.result, Some(json!("payload")));

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
