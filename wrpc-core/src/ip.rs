use crate::error::{Result, WrpcErr};
use std::net::IpAddr;

/// 本机 IP 解析
///
/// 注册时每次都会重新解析一次，IP 变化后注册路径随之变化。
pub trait IpResolver: Send + Sync + 'static {
    fn resolve(&self) -> Result<String>;
}

/// 取第一个非回环的 IPv4 地址
#[derive(Debug, Clone, Default)]
pub struct LocalIpResolver;

impl LocalIpResolver {
    pub fn new() -> Self {
        Self
    }
}

impl IpResolver for LocalIpResolver {
    fn resolve(&self) -> Result<String> {
        match local_ip_address::local_ip() {
            Ok(IpAddr::V4(ip)) if !ip.is_loopback() => return Ok(ip.to_string()),
            Ok(ip) => log::debug!("Default route ip {} is not usable, scanning interfaces", ip),
            Err(e) => log::debug!("Failed to resolve default route ip: {}", e),
        }

        let interfaces = local_ip_address::list_afinet_netifas()
            .map_err(|e| WrpcErr::invalid_state(format!("failed to list interfaces: {}", e)))?;
        interfaces
            .into_iter()
            .find_map(|(_, ip)| match ip {
                IpAddr::V4(v4) if !v4.is_loopback() => Some(v4.to_string()),
                _ => None,
            })
            .ok_or_else(|| WrpcErr::invalid_state("no non-loopback ipv4 address found"))
    }
}

/// 固定 IP
#[derive(Debug, Clone)]
pub struct FixedIpResolver {
    ip: String,
}

impl FixedIpResolver {
    pub fn new(ip: impl Into<String>) -> Self {
        Self { ip: ip.into() }
    }
}

impl IpResolver for FixedIpResolver {
    fn resolve(&self) -> Result<String> {
        Ok(self.ip.clone())
    }
}
