//! 传输层抽象
//!
//! 提供 Connector trait 使桥接层与具体的上游连接方式解耦，
//! 以及按行读写 JSON 的 LineReader / LineWriter。

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{FramingError, ProtocolError, Result};
use crate::message::encode_line;
use crate::{CONNECT_TIMEOUT, MAX_LINE_SIZE};

/// 连接器 trait（桥接服务连接上游中继时使用）
#[async_trait]
pub trait Connector: Send + Sync {
    /// 建立连接
    async fn connect(&self) -> Result<LineConnection>;

    /// 目标地址，用于日志
    fn target(&self) -> String;
}

// ============================================================================
// TCP 实现
// ============================================================================

/// TCP 连接器
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<LineConnection> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| ProtocolError::ConnectionTimeout)?
            .map_err(|source| ProtocolError::UpstreamUnavailable {
                addr: self.addr.clone(),
                source,
            })?;
        debug!(addr = %self.addr, "Upstream connected");

        LineConnection::from_stream(stream)
    }

    fn target(&self) -> String {
        self.addr.clone()
    }
}

/// 按行收发 JSON 的 TCP 连接
pub struct LineConnection {
    reader: LineReader<OwnedReadHalf>,
    writer: LineWriter<OwnedWriteHalf>,
}

impl LineConnection {
    /// 从 TcpStream 创建
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            reader: LineReader::new(read_half),
            writer: LineWriter::new(write_half),
        })
    }

    /// 分离读写端
    pub fn split(self) -> (LineReader<OwnedReadHalf>, LineWriter<OwnedWriteHalf>) {
        (self.reader, self.writer)
    }
}

// ============================================================================
// 行编解码
// ============================================================================

/// 行读取器
pub struct LineReader<R> {
    reader: BufReader<R>,
    buffer: Vec<u8>,
    max_len: usize,
}

impl<R: AsyncRead + Unpin + Send> LineReader<R> {
    /// 创建新的行读取器
    pub fn new(reader: R) -> Self {
        Self::with_max_len(reader, MAX_LINE_SIZE)
    }

    pub fn with_max_len(reader: R, max_len: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            buffer: Vec::with_capacity(256),
            max_len,
        }
    }

    /// 读取下一行，去掉行尾的 `\n` / `\r\n`；流结束时返回 `None`
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        self.buffer.clear();

        let limit = self.max_len as u64 + 1;
        let n = (&mut self.reader)
            .take(limit)
            .read_until(b'\n', &mut self.buffer)
            .await?;

        if n == 0 {
            return Ok(None);
        }

        if self.buffer.last() == Some(&b'\n') {
            self.buffer.pop();
            if self.buffer.last() == Some(&b'\r') {
                self.buffer.pop();
            }
        }

        // 没有换行且超出上限，说明这一行还没读完
        if self.buffer.len() > self.max_len {
            return Err(ProtocolError::LineTooLong {
                size: self.buffer.len(),
                max: self.max_len,
            });
        }

        // 非 UTF-8 的行已被整行读掉，调用方丢弃后可以继续读下一行
        let line = std::str::from_utf8(&self.buffer).map_err(FramingError::from)?;
        Ok(Some(line.to_string()))
    }
}

/// 行写入器
pub struct LineWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin + Send> LineWriter<W> {
    /// 创建新的行写入器
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// 编码并写入一行，整行一次写出
    pub async fn write_message<M: Serialize>(&mut self, msg: &M) -> Result<()> {
        let line = encode_line(msg)?;
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// 刷新后关闭写端
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.flush().await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}
