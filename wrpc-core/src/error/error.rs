use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WrpcErr>;

/// 错误码，服务端错误帧里携带的就是这个值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Unknown = 0,
    InvalidConfig = 1,
    NoServerAvailable = 2,
    PoolExhausted = 3,
    ConnectionError = 4,
    TransportError = 5,
    RemoteError = 6,
    UnknownMethod = 7,
    ServiceNotFound = 8,
    NotSupported = 9,
    Timeout = 10,
    CodecError = 11,
    CoordinationError = 12,
}

impl ErrorCode {
    pub fn from_i32(code: i32) -> Self {
        match code {
            1 => ErrorCode::InvalidConfig,
            2 => ErrorCode::NoServerAvailable,
            3 => ErrorCode::PoolExhausted,
            4 => ErrorCode::ConnectionError,
            5 => ErrorCode::TransportError,
            6 => ErrorCode::RemoteError,
            7 => ErrorCode::UnknownMethod,
            8 => ErrorCode::ServiceNotFound,
            9 => ErrorCode::NotSupported,
            10 => ErrorCode::Timeout,
            11 => ErrorCode::CodecError,
            12 => ErrorCode::CoordinationError,
            _ => ErrorCode::Unknown,
        }
    }
}

#[derive(Debug, Error)]
pub enum WrpcErr {
    #[error("invalid node format `{0}`")]
    InvalidNodeFormat(String),

    #[error("invalid address config `{0}`")]
    InvalidAddressConfig(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("no server available")]
    NoServerAvailable,

    #[error("pool exhausted for `{key}` after waiting {waited:?}")]
    PoolExhausted { key: String, waited: Duration },

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("transport error: {0}")]
    TransportError(String),

    /// 服务端业务异常（远端返回的错误帧）
    #[error("remote error: {0}")]
    RemoteError(String),

    #[error("unknown method `{method}` of service `{service}`")]
    UnknownMethod { service: String, method: String },

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("node not found: {0}")]
    NoNode(String),

    #[error("coordination error: {0}")]
    CoordinationError(String),

    #[error("coordination session expired")]
    SessionExpired,

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("codec error: {0}")]
    CodecError(String),

    #[error("call failed after {attempts} attempts: {source}")]
    CallFailed {
        attempts: u32,
        #[source]
        source: Box<WrpcErr>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WrpcErr {
    // 获取错误码
    pub fn code(&self) -> ErrorCode {
        match self {
            WrpcErr::InvalidNodeFormat(_)
            | WrpcErr::InvalidAddressConfig(_)
            | WrpcErr::InvalidConfig(_) => ErrorCode::InvalidConfig,
            WrpcErr::NoServerAvailable => ErrorCode::NoServerAvailable,
            WrpcErr::PoolExhausted { .. } => ErrorCode::PoolExhausted,
            WrpcErr::ConnectionError(_) => ErrorCode::ConnectionError,
            WrpcErr::TransportError(_) | WrpcErr::Io(_) => ErrorCode::TransportError,
            WrpcErr::RemoteError(_) => ErrorCode::RemoteError,
            WrpcErr::UnknownMethod { .. } => ErrorCode::UnknownMethod,
            WrpcErr::ServiceNotFound(_) => ErrorCode::ServiceNotFound,
            WrpcErr::NotSupported(_) => ErrorCode::NotSupported,
            WrpcErr::Timeout(_) => ErrorCode::Timeout,
            WrpcErr::CodecError(_) => ErrorCode::CodecError,
            WrpcErr::NodeExists(_)
            | WrpcErr::NoNode(_)
            | WrpcErr::CoordinationError(_)
            | WrpcErr::SessionExpired => ErrorCode::CoordinationError,
            WrpcErr::CallFailed { source, .. } => source.code(),
            WrpcErr::InvalidState(_) | WrpcErr::Other(_) => ErrorCode::Unknown,
        }
    }

    /// 根据服务端返回的错误码还原客户端错误
    ///
    /// `service` / `method` 用于还原 `UnknownMethod`，其余错误只保留消息文本。
    pub fn from_code(code: i32, message: impl Into<String>, service: &str, method: &str) -> Self {
        let message = message.into();
        match ErrorCode::from_i32(code) {
            ErrorCode::UnknownMethod => WrpcErr::UnknownMethod {
                service: service.to_string(),
                method: method.to_string(),
            },
            ErrorCode::ServiceNotFound => WrpcErr::ServiceNotFound(message),
            ErrorCode::NotSupported => WrpcErr::NotSupported(message),
            ErrorCode::CodecError => WrpcErr::CodecError(message),
            ErrorCode::Timeout => WrpcErr::Timeout(message),
            _ => WrpcErr::RemoteError(message),
        }
    }

    /// 连接层面的错误：拒绝连接、断开、超时等
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            WrpcErr::ConnectionError(_)
                | WrpcErr::TransportError(_)
                | WrpcErr::Io(_)
                | WrpcErr::Timeout(_)
        )
    }

    /// 配置错误和调用方错误不重试，其余都会消耗一次重试
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            WrpcErr::InvalidNodeFormat(_)
                | WrpcErr::InvalidAddressConfig(_)
                | WrpcErr::InvalidConfig(_)
                | WrpcErr::UnknownMethod { .. }
                | WrpcErr::NotSupported(_)
        )
    }

    // 错误转换辅助方法
    pub fn from_str(s: impl Into<String>) -> Self {
        WrpcErr::Other(anyhow::anyhow!(s.into()))
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        WrpcErr::InvalidConfig(msg.into())
    }

    pub fn connection_error(msg: impl Into<String>) -> Self {
        WrpcErr::ConnectionError(msg.into())
    }

    pub fn transport_error(msg: impl Into<String>) -> Self {
        WrpcErr::TransportError(msg.into())
    }

    pub fn remote_error(msg: impl Into<String>) -> Self {
        WrpcErr::RemoteError(msg.into())
    }

    pub fn coordination_error(msg: impl Into<String>) -> Self {
        WrpcErr::CoordinationError(msg.into())
    }

    pub fn not_found_service(msg: impl Into<String>) -> Self {
        WrpcErr::ServiceNotFound(msg.into())
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        WrpcErr::NotSupported(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        WrpcErr::Timeout(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        WrpcErr::InvalidState(msg.into())
    }

    pub fn unknown_method(service: impl Into<String>, method: impl Into<String>) -> Self {
        WrpcErr::UnknownMethod {
            service: service.into(),
            method: method.into(),
        }
    }
}

// 实现 From trait 用于错误转换
impl From<String> for WrpcErr {
    fn from(s: String) -> Self {
        WrpcErr::from_str(s)
    }
}

impl From<&str> for WrpcErr {
    fn from(s: &str) -> Self {
        WrpcErr::from_str(s)
    }
}

impl From<serde_json::Error> for WrpcErr {
    fn from(err: serde_json::Error) -> Self {
        WrpcErr::CodecError(err.to_string())
    }
}

impl From<WrpcErr> for ErrorCode {
    fn from(err: WrpcErr) -> Self {
        err.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip_for_wire_errors() {
        let err = WrpcErr::unknown_method("MessageService", "sendSMS");
        let code = err.code() as i32;
        match WrpcErr::from_code(code, "ignored", "MessageService", "sendSMS") {
            WrpcErr::UnknownMethod { service, method } => {
                assert_eq!(service, "MessageService");
                assert_eq!(method, "sendSMS");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let remote = WrpcErr::from_code(ErrorCode::RemoteError as i32, "boom", "s", "m");
        assert!(matches!(remote, WrpcErr::RemoteError(msg) if msg == "boom"));

        let unknown = WrpcErr::from_code(999, "weird", "s", "m");
        assert!(matches!(unknown, WrpcErr::RemoteError(_)));
    }

    #[test]
    fn test_classification() {
        assert!(WrpcErr::connection_error("refused").is_transport());
        assert!(WrpcErr::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe)).is_transport());
        assert!(!WrpcErr::remote_error("bad input").is_transport());

        assert!(WrpcErr::remote_error("bad input").is_retryable());
        assert!(WrpcErr::NoServerAvailable.is_retryable());
        assert!(!WrpcErr::unknown_method("s", "m").is_retryable());
        assert!(!WrpcErr::InvalidNodeFormat("x".into()).is_retryable());
    }

    #[test]
    fn test_call_failed_keeps_source_code() {
        let err = WrpcErr::CallFailed {
            attempts: 3,
            source: Box::new(WrpcErr::connection_error("refused")),
        };
        assert_eq!(err.code(), ErrorCode::ConnectionError);
        assert!(err.to_string().contains("3 attempts"));
    }
}
