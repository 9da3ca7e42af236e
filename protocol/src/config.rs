//! 网络配置

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::{
    CONNECT_TIMEOUT_SECS, DEFAULT_BRIDGE_HOST, DEFAULT_BRIDGE_PORT, DEFAULT_RELAY_HOST,
    DEFAULT_RELAY_PORT, MAX_PEERS,
};

/// 中继服务配置
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// 同时在线的最大连接数
    pub max_peers: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_RELAY_HOST.to_string(),
            port: DEFAULT_RELAY_PORT,
            max_peers: MAX_PEERS,
        }
    }
}

impl RelayConfig {
    /// 监听地址
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// 文件存在则读取，否则使用默认值
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        load_or_default(path.as_ref())
    }
}

/// 桥接服务配置
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// WebSocket 监听地址
    pub host: String,
    pub port: u16,
    /// 上游中继地址
    pub relay_host: String,
    pub relay_port: u16,
    pub connect_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_BRIDGE_HOST.to_string(),
            port: DEFAULT_BRIDGE_PORT,
            relay_host: DEFAULT_RELAY_HOST.to_string(),
            relay_port: DEFAULT_RELAY_PORT,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
        }
    }
}

impl BridgeConfig {
    /// WebSocket 监听地址
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// 上游中继地址
    pub fn relay_addr(&self) -> String {
        format!("{}:{}", self.relay_host, self.relay_port)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        load_or_default(path.as_ref())
    }
}

fn load_or_default<T: Default + for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}
