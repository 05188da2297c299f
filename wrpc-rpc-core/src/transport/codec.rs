use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use wrpc_core::{Result, WrpcErr};

/// 单帧最大长度
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// 请求帧，`service` 是多路复用的 key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

/// 响应帧，`result` 和 `error` 二选一
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, err: &WrpcErr) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcError {
                code: err.code() as i32,
                message: err.to_string(),
            }),
        }
    }

    /// 还原成调用结果
    pub fn into_result(self, service: &str, method: &str) -> Result<Value> {
        match self.error {
            Some(err) => Err(WrpcErr::from_code(err.code, err.message, service, method)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// 写一帧：4 字节大端长度 + JSON
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(WrpcErr::CodecError(format!(
            "frame too large: {} > {}",
            body.len(),
            MAX_FRAME_SIZE
        )));
    }

    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// 读一帧，对端在帧边界关闭连接时返回 `None`
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(WrpcErr::CodecError(format!(
            "frame too large: {} > {}",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

pub fn decode<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(body)?)
}
