//! 协议常量定义

use std::time::Duration;

/// 中继服务默认监听地址
pub const DEFAULT_RELAY_HOST: &str = "127.0.0.1";

/// 中继服务默认端口
pub const DEFAULT_RELAY_PORT: u16 = 65432;

/// 桥接服务默认监听地址
pub const DEFAULT_BRIDGE_HOST: &str = "0.0.0.0";

/// 桥接服务默认 WebSocket 端口
pub const DEFAULT_BRIDGE_PORT: u16 = 8765;

/// 中继服务最大连接数
pub const MAX_PEERS: usize = 100;

/// 中继单次读取的字节数
pub const READ_CHUNK_SIZE: usize = 1024;

/// 每个连接的待发送队列长度（以数据块计）
pub const PEER_QUEUE_CAPACITY: usize = 256;

/// 队列满时等待对端消费的最长时间（秒），超时即断开该连接
pub const PEER_SEND_TIMEOUT_SECS: u64 = 2;

/// 队列满时等待 Duration
pub const PEER_SEND_TIMEOUT: Duration = Duration::from_secs(PEER_SEND_TIMEOUT_SECS);

/// 单行 JSON 最大长度
pub const MAX_LINE_SIZE: usize = 65536;

/// 连接超时（秒）
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// 连接超时 Duration
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(CONNECT_TIMEOUT_SECS);

/// 上游不可用时发给前端的错误信息
pub const UPSTREAM_UNAVAILABLE_MESSAGE: &str = "Failed to connect to AI server";
