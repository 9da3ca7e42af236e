//! 错误类型定义

use thiserror::Error;

/// 帧内容错误：JSON 格式不对或缺少字段，丢弃该条消息即可
#[derive(Error, Debug)]
pub enum FramingError {
    /// 无法解析的 JSON
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// 顶层不是对象
    #[error("Message is not a JSON object")]
    NotAnObject,

    /// 缺少 type 字段
    #[error("Message has no `type` field")]
    MissingType,

    /// 不支持的消息类型
    #[error("Unsupported message type: {0}")]
    UnsupportedType(String),

    /// 缺少 move 字段
    #[error("Message has no `move` field")]
    MissingMove,

    /// 行内容不是合法 UTF-8
    #[error("Line is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

/// 协议错误类型
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 序列化错误
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// 帧内容错误
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    /// 单行超长
    #[error("Line too large: {size} bytes (max: {max})")]
    LineTooLong { size: usize, max: usize },

    /// 连接超时
    #[error("Connection timeout")]
    ConnectionTimeout,

    /// 无法连接上游中继
    #[error("Upstream {addr} unavailable: {source}")]
    UpstreamUnavailable {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// 连接已关闭
    #[error("Connection closed")]
    ConnectionClosed,
}

/// 协议操作结果类型
pub type Result<T> = std::result::Result<T, ProtocolError>;
