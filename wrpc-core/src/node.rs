use crate::config::{DEFAULT_WEIGHT, MAX_WEIGHT};
use crate::error::{Result, WrpcErr};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// `ip:port[:weight]`，多个节点用逗号分隔
static HOSTS_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{1,3}(\.\d{1,3}){3}(:\d+){1,2}(,\d{1,3}(\.\d{1,3}){3}(:\d+){1,2})*$")
        .expect("hosts pattern is valid")
});

/// 服务节点
///
/// 相等性只看 `(address, port)`，权重只影响被选中的频率。
/// 权重取值 `1..=MAX_WEIGHT`，0 视为默认权重。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerNode {
    address: String,
    port: u16,
    weight: u32,
}

impl ServerNode {
    pub fn new(address: impl Into<String>, port: u16, weight: u32) -> Self {
        Self {
            address: address.into(),
            port,
            weight: match weight {
                0 => DEFAULT_WEIGHT,
                w => w.min(MAX_WEIGHT),
            },
        }
    }

    /// 解析 `ip:port` 或 `ip:port:weight`，两段式使用 `default_weight`
    pub fn parse_with_default(node: &str, default_weight: u32) -> Result<Self> {
        let invalid = || WrpcErr::InvalidNodeFormat(node.to_string());

        let fields: Vec<&str> = node.split(':').collect();
        let (address, port, weight) = match fields.as_slice() {
            [address, port] => (*address, *port, None),
            [address, port, weight] => (*address, *port, Some(*weight)),
            _ => return Err(invalid()),
        };

        if address.is_empty() {
            return Err(invalid());
        }
        let port = parse_digits::<u16>(port).ok_or_else(invalid)?;
        let weight = match weight {
            Some(w) => parse_digits::<u32>(w).ok_or_else(invalid)?,
            None => default_weight,
        };
        if weight > MAX_WEIGHT {
            return Err(invalid());
        }

        Ok(Self::new(address, port, weight))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// 传输层连接地址 `ip:port`
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// 注册中心里的节点名 `ip:port:weight`
    pub fn node_name(&self) -> String {
        self.to_string()
    }
}

// 只接受纯数字，拒绝 `+1`、空串之类 `parse` 能吃下的写法
fn parse_digits<T: FromStr>(s: &str) -> Option<T> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

impl FromStr for ServerNode {
    type Err = WrpcErr;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_with_default(s, DEFAULT_WEIGHT)
    }
}

impl fmt::Display for ServerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.address, self.port, self.weight)
    }
}

impl PartialEq for ServerNode {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.port == other.port
    }
}

impl Eq for ServerNode {}

impl Hash for ServerNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.port.hash(state);
    }
}

/// 校验静态地址配置
pub fn check_hosts(hosts: &str) -> bool {
    HOSTS_PATTERN.is_match(hosts)
}

/// 解析静态地址配置 `ip:port[:weight][,ip:port[:weight]]*`
pub fn parse_server_address(server_address: &str) -> Result<Vec<ServerNode>> {
    if !check_hosts(server_address) {
        return Err(WrpcErr::InvalidAddressConfig(server_address.to_string()));
    }

    let mut nodes: Vec<ServerNode> = Vec::new();
    for part in server_address.split(',') {
        let node: ServerNode = part
            .parse()
            .map_err(|_| WrpcErr::InvalidAddressConfig(server_address.to_string()))?;
        if !nodes.contains(&node) {
            nodes.push(node);
        }
    }
    Ok(nodes)
}
