//! 消息类型定义与格式转换
//!
//! TCP 一侧每行一个 `{"move": ...}`，WebSocket 一侧每帧一个
//! `{"type": "move", "move": ...}`。`move` 的值原样透传，不做任何校验。

use std::io;

use serde::{Deserialize, Serialize};
use serde_json::ser::Formatter;
use serde_json::{Map, Value};

use crate::error::FramingError;

/// TCP 中继上的走子消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayMove {
    #[serde(rename = "move")]
    pub mv: Value,
}

impl RelayMove {
    pub fn new(mv: impl Into<Value>) -> Self {
        Self { mv: mv.into() }
    }
}

/// WebSocket 前端消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WsMessage {
    /// 走子
    Move {
        #[serde(rename = "move")]
        mv: Value,
    },
    /// 桥接服务生成的错误
    Error { message: String },
}

impl WsMessage {
    pub fn error(message: impl Into<String>) -> Self {
        WsMessage::Error {
            message: message.into(),
        }
    }

    /// 编码为单帧文本
    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

fn parse_object(text: &str) -> Result<Map<String, Value>, FramingError> {
    match serde_json::from_str::<Value>(text)? {
        Value::Object(obj) => Ok(obj),
        _ => Err(FramingError::NotAnObject),
    }
}

/// WebSocket 帧 -> TCP 消息，只接受 `type == "move"`
pub fn ws_to_relay(text: &str) -> Result<RelayMove, FramingError> {
    let mut obj = parse_object(text)?;

    match obj.get("type") {
        Some(Value::String(t)) if t == "move" => {}
        Some(Value::String(t)) => return Err(FramingError::UnsupportedType(t.clone())),
        Some(other) => return Err(FramingError::UnsupportedType(other.to_string())),
        None => return Err(FramingError::MissingType),
    }

    let mv = obj.remove("move").ok_or(FramingError::MissingMove)?;
    Ok(RelayMove { mv })
}

/// TCP 行 -> WebSocket 帧
pub fn relay_to_ws(line: &str) -> Result<WsMessage, FramingError> {
    let mut obj = parse_object(line)?;
    let mv = obj.remove("move").ok_or(FramingError::MissingMove)?;
    Ok(WsMessage::Move { mv })
}

/// 键值之间用 `": "`、成员之间用 `", "` 的紧凑格式，
/// 与走子客户端收发的行逐字节一致
#[derive(Debug, Clone, Copy, Default)]
pub struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }
}

/// 编码为一行（含结尾换行符）
pub fn encode_line<M: Serialize>(msg: &M) -> serde_json::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, SpacedFormatter);
    msg.serialize(&mut ser)?;
    buf.push(b'\n');
    Ok(buf)
}
