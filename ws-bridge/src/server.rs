//! WebSocket 桥接服务器

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tracing::{error, info, warn};

use protocol::{BridgeConfig, Connector, Result, TcpConnector};

use crate::session::{Session, SessionEnd, SessionId};

/// accept 出错后的等待时间
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// 桥接服务器：每个 WebSocket 连接一个会话
pub struct BridgeServer<C = TcpConnector> {
    listener: TcpListener,
    connector: Arc<C>,
    next_session_id: AtomicU64,
}

impl BridgeServer<TcpConnector> {
    /// 按配置绑定 WebSocket 监听地址，上游使用 TCP 中继
    pub async fn bind(config: &BridgeConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.addr()).await?;
        let connector = TcpConnector::new(config.relay_addr())
            .with_timeout(Duration::from_secs(config.connect_timeout_secs));
        Ok(Self::with_connector(listener, connector))
    }
}

impl<C: Connector + 'static> BridgeServer<C> {
    pub fn with_connector(listener: TcpListener, connector: C) -> Self {
        Self {
            listener,
            connector: Arc::new(connector),
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 接受连接循环，单个会话失败不影响后续连接
    pub async fn run(self) -> Result<()> {
        info!(
            "WebSocket bridge listening on {}, relay {}",
            self.local_addr()?,
            self.connector.target()
        );

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
                    let connector = Arc::clone(&self.connector);
                    tokio::spawn(Self::handle_connection(connector, stream, addr, id));
                }
                Err(e) => {
                    error!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    async fn handle_connection(connector: Arc<C>, stream: TcpStream, addr: SocketAddr, id: SessionId) {
        let ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(%addr, "WebSocket handshake failed: {}", e);
                return;
            }
        };
        info!(session_id = id, %addr, "New WebSocket connection");

        let mut session = Session::new(id, ws);
        match session.run(connector.as_ref()).await {
            SessionEnd::Failed(e) => warn!(session_id = id, %addr, "Session ended with error: {}", e),
            end => info!(session_id = id, %addr, "Session ended: {:?}", end),
        }
    }
}
