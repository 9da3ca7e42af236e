//! 走子中继共享协议库
//!
//! 包含:
//! - 常量与配置 (RelayConfig, BridgeConfig)
//! - 消息类型定义 (RelayMove, WsMessage) 及两侧格式转换
//! - 传输层抽象 (Connector) 与按行 JSON 编解码 (LineReader, LineWriter)

mod config;
mod constants;
mod error;
mod message;
mod transport;

pub use config::{BridgeConfig, RelayConfig};
pub use constants::*;
pub use error::{FramingError, ProtocolError, Result};
pub use message::{encode_line, relay_to_ws, ws_to_relay, RelayMove, SpacedFormatter, WsMessage};
pub use transport::{
    Connector, LineConnection, LineReader, LineWriter, TcpConnector,
};
