//! 桥接会话
//!
//! 一个 WebSocket 连接对应一条到中继的 TCP 连接。
//! 状态流转：Connecting -> Active -> Closing -> Closed。
//! 两个转发方向任一结束，另一方向立即取消，随后关闭两端。

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use protocol::{
    relay_to_ws, ws_to_relay, Connector, LineReader, LineWriter, ProtocolError, WsMessage,
    UPSTREAM_UNAVAILABLE_MESSAGE,
};

use crate::error::{BridgeError, Result};

/// 会话 ID
pub type SessionId = u64;

/// 等待对端回应关闭帧的时间
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// 正在连接中继
    Connecting,
    /// 双向转发中
    Active,
    /// 正在关闭两端
    Closing,
    /// 已关闭
    Closed,
}

/// 会话结束原因
#[derive(Debug)]
pub enum SessionEnd {
    /// 无法连接中继
    UpstreamUnavailable,
    /// 前端关闭了 WebSocket
    WebSocketClosed,
    /// 中继关闭了 TCP 连接
    RelayClosed,
    /// 某一方向出错
    Failed(BridgeError),
}

/// 桥接会话
pub struct Session<S> {
    id: SessionId,
    state: SessionState,
    started_at: DateTime<Utc>,
    ws: WebSocketStream<S>,
    relay_reader: Option<LineReader<OwnedReadHalf>>,
    relay_writer: Option<LineWriter<OwnedWriteHalf>>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(id: SessionId, ws: WebSocketStream<S>) -> Self {
        Self {
            id,
            state: SessionState::Connecting,
            started_at: Utc::now(),
            ws,
            relay_reader: None,
            relay_writer: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        debug!(session_id = self.id, from = ?self.state, to = ?next, "Session state changed");
        self.state = next;
    }

    /// 连接中继并双向转发，直到任一方向结束；返回前两端都已关闭
    pub async fn run<C: Connector + ?Sized>(&mut self, connector: &C) -> SessionEnd {
        if self.state != SessionState::Connecting {
            return SessionEnd::Failed(BridgeError::Protocol(ProtocolError::ConnectionClosed));
        }

        let conn = match connector.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(session_id = self.id, relay = %connector.target(), "Failed to connect to relay: {}", e);
                self.send_error(UPSTREAM_UNAVAILABLE_MESSAGE).await;
                self.close().await;
                return SessionEnd::UpstreamUnavailable;
            }
        };
        info!(session_id = self.id, relay = %connector.target(), "Connected to relay");

        let (reader, writer) = conn.split();
        self.relay_reader = Some(reader);
        self.relay_writer = Some(writer);
        self.transition(SessionState::Active);

        let end = self.forward().await;
        match &end {
            SessionEnd::Failed(e) => warn!(session_id = self.id, "Session failed: {}", e),
            other => info!(session_id = self.id, "Session ending: {:?}", other),
        }

        self.close().await;
        end
    }

    /// 两个方向同时转发，先结束者胜出，另一方向随 future 被丢弃而取消
    async fn forward(&mut self) -> SessionEnd {
        let id = self.id;
        let Session {
            ws,
            relay_reader,
            relay_writer,
            ..
        } = self;
        let (Some(reader), Some(writer)) = (relay_reader.as_mut(), relay_writer.as_mut()) else {
            return SessionEnd::RelayClosed;
        };
        let (mut ws_sink, mut ws_stream) = ws.split();

        tokio::select! {
            res = forward_ws_to_relay(id, &mut ws_stream, writer) => match res {
                Ok(()) => SessionEnd::WebSocketClosed,
                Err(e) => SessionEnd::Failed(e),
            },
            res = forward_relay_to_ws(id, reader, &mut ws_sink) => match res {
                Ok(()) => SessionEnd::RelayClosed,
                Err(e) => SessionEnd::Failed(e),
            },
        }
    }

    /// 尽力发送一条错误帧
    async fn send_error(&mut self, message: &str) {
        let frame = match WsMessage::error(message).to_text() {
            Ok(text) => text,
            Err(e) => {
                error!(session_id = self.id, "Failed to encode error frame: {}", e);
                return;
            }
        };
        if let Err(e) = self.ws.send(Message::text(frame)).await {
            debug!(session_id = self.id, "Could not deliver error frame: {}", e);
        }
    }

    /// 关闭两端；重复调用无副作用
    pub async fn close(&mut self) {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return;
        }
        self.transition(SessionState::Closing);

        if let Some(mut writer) = self.relay_writer.take() {
            if let Err(e) = writer.shutdown().await {
                debug!(session_id = self.id, "Relay shutdown error ignored: {}", e);
            }
        }
        self.relay_reader = None;

        if let Err(e) = self.ws.close(None).await {
            debug!(session_id = self.id, "WebSocket close error ignored: {}", e);
        }
        // 等对端回应关闭帧，完成关闭握手
        let ws = &mut self.ws;
        let _ = timeout(CLOSE_TIMEOUT, async {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        self.transition(SessionState::Closed);
        let elapsed = Utc::now() - self.started_at;
        info!(session_id = self.id, duration_ms = elapsed.num_milliseconds(), "Session closed");
    }
}

/// WebSocket -> 中继：只转发 `type == "move"` 的消息
async fn forward_ws_to_relay<St, W>(
    session_id: SessionId,
    ws: &mut St,
    relay: &mut LineWriter<W>,
) -> Result<()>
where
    St: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin,
    W: AsyncWrite + Unpin + Send,
{
    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(text) => forward_text(session_id, text.as_str(), relay).await?,
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => forward_text(session_id, text, relay).await?,
                Err(e) => warn!(session_id, "Dropping non UTF-8 binary frame: {}", e),
            },
            Message::Close(frame) => {
                debug!(session_id, ?frame, "WebSocket close frame received");
                break;
            }
            // ping/pong 由 WebSocket 层自动处理
            _ => {}
        }
    }
    Ok(())
}

async fn forward_text<W: AsyncWrite + Unpin + Send>(
    session_id: SessionId,
    text: &str,
    relay: &mut LineWriter<W>,
) -> Result<()> {
    debug!(session_id, "WS -> TCP: {}", text);
    match ws_to_relay(text) {
        Ok(msg) => relay.write_message(&msg).await?,
        Err(e) => warn!(session_id, "Dropping WebSocket message: {}", e),
    }
    Ok(())
}

/// 中继 -> WebSocket：逐行转换，空行跳过，坏行丢弃
async fn forward_relay_to_ws<R, Si>(
    session_id: SessionId,
    relay: &mut LineReader<R>,
    ws: &mut Si,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    Si: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        let line = match relay.read_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(ProtocolError::Framing(e)) => {
                warn!(session_id, "Dropping relay line: {}", e);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        debug!(session_id, "TCP -> WS: {}", line);

        match relay_to_ws(line) {
            Ok(msg) => ws.send(Message::text(msg.to_text()?)).await?,
            Err(e) => warn!(session_id, "Dropping relay line: {}", e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    use async_trait::async_trait;
    use protocol::LineConnection;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    /// 永远连不上的连接器
    struct Unreachable;

    #[async_trait]
    impl Connector for Unreachable {
        async fn connect(&self) -> protocol::Result<LineConnection> {
            Err(ProtocolError::ConnectionTimeout)
        }

        fn target(&self) -> String {
            "unreachable".to_string()
        }
    }

    async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (server_io, client_io) = tokio::io::duplex(4096);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        (server, client)
    }

    #[tokio::test]
    async fn test_upstream_unavailable_sends_one_error() {
        let (server, mut client) = ws_pair().await;
        let client_task = tokio::spawn(async move {
            let mut texts = Vec::new();
            while let Some(Ok(msg)) = client.next().await {
                if let Message::Text(text) = msg {
                    texts.push(text.as_str().to_string());
                }
            }
            texts
        });

        let mut session = Session::new(1, server);
        let end = session.run(&Unreachable).await;
        assert!(matches!(end, SessionEnd::UpstreamUnavailable));
        assert_eq!(session.state(), SessionState::Closed);
        drop(session);

        let texts = client_task.await.unwrap();
        assert_eq!(texts.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&texts[0]).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"type": "error", "message": "Failed to connect to AI server"})
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (server, mut client) = ws_pair().await;
        let client_task = tokio::spawn(async move { while let Some(Ok(_)) = client.next().await {} });

        let mut session = Session::new(7, server);
        assert_eq!(session.id(), 7);
        assert_eq!(session.state(), SessionState::Connecting);

        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);

        // 已关闭的会话不会再连接中继
        let end = session.run(&Unreachable).await;
        assert!(matches!(end, SessionEnd::Failed(_)));

        drop(session);
        client_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_lines_translated() {
        let input: &[u8] = b"garbage\n\n  \n{\"move\": \"e7e5\"}\n[1]\n{\"move\": \"g8f6\"}\n";
        let mut reader = LineReader::new(input);
        let mut sent = Vec::<Message>::new()
            .sink_map_err(|never: Infallible| -> tungstenite::Error { match never {} });

        forward_relay_to_ws(1, &mut reader, &mut sent).await.unwrap();

        let texts: Vec<String> = sent
            .get_ref()
            .iter()
            .map(|m| m.to_text().unwrap().to_string())
            .collect();
        assert_eq!(
            texts,
            vec![
                r#"{"type":"move","move":"e7e5"}"#.to_string(),
                r#"{"type":"move","move":"g8f6"}"#.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_utf8_relay_line_dropped() {
        let input: &[u8] = b"{\"move\": \"e2\xffe4\"}\n{\"move\": \"e7e5\"}\n";
        let mut reader = LineReader::new(input);
        let mut sent = Vec::<Message>::new()
            .sink_map_err(|never: Infallible| -> tungstenite::Error { match never {} });

        forward_relay_to_ws(1, &mut reader, &mut sent).await.unwrap();

        let texts: Vec<&str> = sent.get_ref().iter().map(|m| m.to_text().unwrap()).collect();
        assert_eq!(texts, vec![r#"{"type":"move","move":"e7e5"}"#]);
    }

    #[tokio::test]
    async fn test_ws_messages_translated() {
        let frames: Vec<std::result::Result<Message, tungstenite::Error>> = vec![
            Ok(Message::text("not json".to_string())),
            Ok(Message::text(r#"{"type":"chat","text":"hi"}"#.to_string())),
            Ok(Message::text(r#"{"type":"move","move":"e2e4"}"#.to_string())),
            Ok(Message::binary(br#"{"type":"move","move":"d2d4"}"#.to_vec())),
            Ok(Message::Close(None)),
            Ok(Message::text(r#"{"type":"move","move":"never"}"#.to_string())),
        ];
        let mut stream = futures::stream::iter(frames);
        let (out, mut check) = tokio::io::duplex(1024);
        let mut writer = LineWriter::new(out);

        forward_ws_to_relay(1, &mut stream, &mut writer).await.unwrap();
        drop(writer);

        let mut received = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut check, &mut received)
            .await
            .unwrap();
        assert_eq!(received, "{\"move\": \"e2e4\"}\n{\"move\": \"d2d4\"}\n");
    }
}
