use super::codec::{decode, read_frame, write_frame, RpcRequest, RpcResponse};
use super::{Channel, Transport};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use wrpc_core::{Result, WrpcErr};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// TCP 传输
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
    request_timeout: Option<Duration>,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: None,
        }
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// 单次请求超时
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&self, host: &str, port: u16) -> Result<Box<dyn Channel>> {
        let addr = format!("{}:{}", host, port);
        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(WrpcErr::connection_error(format!(
                    "failed to connect {}: {}",
                    addr, e
                )))
            }
            Err(_) => {
                return Err(WrpcErr::connection_error(format!(
                    "connect {} timed out after {:?}",
                    addr, self.connect_timeout
                )))
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("Failed to set TCP_NODELAY on {}: {}", addr, e);
        }
        log::debug!("Connected to {}", addr);

        Ok(Box::new(TcpChannel {
            peer: addr,
            stream: Some(stream),
            next_id: 0,
            request_timeout: self.request_timeout,
        }))
    }
}

/// 一条 TCP 连接，同一时刻只有一个请求在途
pub struct TcpChannel {
    peer: String,
    stream: Option<TcpStream>,
    next_id: u64,
    request_timeout: Option<Duration>,
}

impl TcpChannel {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    async fn round_trip(&mut self, request: &RpcRequest) -> Result<RpcResponse> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| WrpcErr::transport_error(format!("channel to {} is closed", self.peer)))?;

        write_frame(stream, request).await?;
        let body = read_frame(stream)
            .await?
            .ok_or_else(|| WrpcErr::transport_error("connection closed by peer"))?;
        decode(&body)
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn invoke(&mut self, service: &str, method: &str, args: Value) -> Result<Value> {
        self.next_id += 1;
        let request = RpcRequest {
            id: self.next_id,
            service: service.to_string(),
            method: method.to_string(),
            args,
        };

        let outcome = match self.request_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.round_trip(&request)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(WrpcErr::timeout(format!(
                    "{}.{} on {} timed out after {:?}",
                    service, method, self.peer, timeout
                ))),
            },
            None => self.round_trip(&request).await,
        };

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                // 连接状态未知，不再复用
                self.stream = None;
                return Err(match e {
                    WrpcErr::Io(io) => WrpcErr::transport_error(format!("{}: {}", self.peer, io)),
                    other => other,
                });
            }
        };

        if response.id != request.id {
            self.stream = None;
            return Err(WrpcErr::transport_error(format!(
                "response id {} does not match request id {}",
                response.id, request.id
            )));
        }
        response.into_result(service, method)
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            log::debug!("Channel to {} closed", self.peer);
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}
