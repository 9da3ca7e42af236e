//! 错误类型定义

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use protocol::ProtocolError;

/// 桥接会话错误
#[derive(Error, Debug)]
pub enum BridgeError {
    /// TCP 一侧（连接、读写、分行）
    #[error("Relay error: {0}")]
    Protocol(#[from] ProtocolError),

    /// WebSocket 一侧
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Protocol(ProtocolError::Json(e))
    }
}

/// 桥接操作结果类型
pub type Result<T> = std::result::Result<T, BridgeError>;
