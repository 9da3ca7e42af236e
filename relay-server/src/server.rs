//! 中继服务器主逻辑
//!
//! 每个连接一个任务：读到的数据块原样转发给其余所有连接，
//! 不做任何分帧。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use protocol::{RelayConfig, Result, READ_CHUNK_SIZE};

use crate::peer::PeerRegistry;

/// accept 出错后的等待时间
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// 中继服务器
pub struct RelayServer {
    listener: TcpListener,
    registry: Arc<PeerRegistry>,
}

impl RelayServer {
    /// 绑定监听地址
    pub async fn bind(config: &RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.addr()).await?;
        Ok(Self {
            listener,
            registry: Arc::new(PeerRegistry::new(config.max_peers)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 连接表
    pub fn registry(&self) -> Arc<PeerRegistry> {
        Arc::clone(&self.registry)
    }

    /// 接受连接循环，不会因为单个连接出错而退出
    pub async fn run(self) -> Result<()> {
        info!("TCP relay listening on {}", self.local_addr()?);

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let registry = Arc::clone(&self.registry);
                    tokio::spawn(Self::handle_peer(registry, stream, addr));
                }
                Err(e) => {
                    error!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    /// 处理单个连接直到其断开
    async fn handle_peer(registry: Arc<PeerRegistry>, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%addr, "set_nodelay failed: {}", e);
        }
        let (mut reader, writer) = stream.into_split();

        let peer = match registry.register(addr, writer) {
            Ok(peer) => peer,
            Err(mut writer) => {
                warn!(%addr, peers = registry.peer_count(), "Peer limit reached, rejecting connection");
                let _ = writer.shutdown().await;
                return;
            }
        };
        info!(peer_id = peer.id, %addr, peers = registry.peer_count(), "Peer connected");

        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            tokio::select! {
                // 写端出错或被移出连接表
                _ = peer.closed() => {
                    info!(peer_id = peer.id, %addr, "Peer dropped by relay");
                    break;
                }
                res = reader.read(&mut buf) => match res {
                    Ok(0) => break,
                    Ok(n) => {
                        let delivered = registry.broadcast(peer.id, &buf[..n]).await;
                        debug!(peer_id = peer.id, bytes = n, delivered, "Relayed chunk");
                    }
                    Err(e) => {
                        error!(peer_id = peer.id, %addr, "Read failed: {}", e);
                        break;
                    }
                },
            }
        }

        registry.unregister(peer.id);
        let elapsed = Utc::now() - peer.connected_at;
        info!(
            peer_id = peer.id,
            %addr,
            connected_ms = elapsed.num_milliseconds(),
            peers = registry.peer_count(),
            "Peer disconnected"
        );
    }
}
