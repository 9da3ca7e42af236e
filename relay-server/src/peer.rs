//! 连接管理

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use protocol::{PEER_QUEUE_CAPACITY, PEER_SEND_TIMEOUT};

/// 连接 ID
pub type PeerId = u64;

/// 待发送的数据块，所有接收方共享同一份
pub type Chunk = Arc<[u8]>;

/// 已登记的连接
///
/// 数据块先进入该连接自己的队列，由独立的写任务写出，
/// 广播方不会被某个不读数据的连接拖住。
#[derive(Clone)]
pub struct PeerHandle {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    tx: mpsc::Sender<Chunk>,
    cancel: CancellationToken,
}

impl PeerHandle {
    /// 连接被移除或写端出错时完成
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// 写任务：按顺序写出队列中的数据块，出错或被取消时关闭写端
async fn write_loop<W>(id: PeerId, mut writer: W, mut rx: mpsc::Receiver<Chunk>, cancel: CancellationToken)
where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = rx.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };

        let res = tokio::select! {
            _ = cancel.cancelled() => break,
            res = async {
                writer.write_all(&chunk).await?;
                writer.flush().await
            } => res,
        };
        if let Err(e) = res {
            warn!(peer_id = id, "Write failed, closing peer: {}", e);
            break;
        }
    }

    // 先关闭队列再通知读循环退出，之后的入队都会失败
    drop(rx);
    cancel.cancel();
    if let Err(e) = writer.shutdown().await {
        debug!(peer_id = id, "Shutdown error ignored: {}", e);
    }
}

/// 连接表
///
/// 由服务器持有并以 `Arc` 共享；只在增删和取快照时持锁，
/// 入队时不持锁。
pub struct PeerRegistry {
    peers: StdMutex<HashMap<PeerId, PeerHandle>>,
    next_id: AtomicU64,
    max_peers: usize,
    queue_capacity: usize,
    send_timeout: Duration,
}

impl PeerRegistry {
    pub fn new(max_peers: usize) -> Self {
        Self::with_queue(max_peers, PEER_QUEUE_CAPACITY, PEER_SEND_TIMEOUT)
    }

    pub fn with_queue(max_peers: usize, queue_capacity: usize, send_timeout: Duration) -> Self {
        Self {
            peers: StdMutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_peers,
            queue_capacity,
            send_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeerId, PeerHandle>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 生成新的连接 ID
    fn generate_id(&self) -> PeerId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// 登记新连接并启动其写任务；已满时把写端原样交还，由调用方关闭
    pub fn register<W>(&self, addr: SocketAddr, writer: W) -> Result<PeerHandle, W>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut peers = self.lock();
        if peers.len() >= self.max_peers {
            return Err(writer);
        }

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let handle = PeerHandle {
            id: self.generate_id(),
            addr,
            connected_at: Utc::now(),
            tx,
            cancel: CancellationToken::new(),
        };
        tokio::spawn(write_loop(handle.id, writer, rx, handle.cancel.clone()));

        peers.insert(handle.id, handle.clone());
        Ok(handle)
    }

    /// 注销并关闭连接，返回被移除的句柄（已移除则为 None）
    pub fn unregister(&self, id: PeerId) -> Option<PeerHandle> {
        let removed = self.lock().remove(&id);
        if let Some(peer) = &removed {
            peer.cancel.cancel();
        }
        removed
    }

    /// 除 `id` 之外的所有连接的快照
    pub fn snapshot_except(&self, id: PeerId) -> Vec<PeerHandle> {
        self.lock()
            .values()
            .filter(|peer| peer.id != id)
            .cloned()
            .collect()
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn peer_count(&self) -> usize {
        self.lock().len()
    }

    /// 把数据块放入除发送者外所有连接的队列，返回成功入队的连接数。
    /// 写任务已退出或队列在超时内一直满的连接会被注销。
    pub async fn broadcast(&self, from: PeerId, chunk: &[u8]) -> usize {
        let chunk: Chunk = Arc::from(chunk);
        let mut delivered = 0;

        for peer in self.snapshot_except(from) {
            if peer.is_closed() {
                self.unregister(peer.id);
                continue;
            }
            match timeout(self.send_timeout, peer.tx.send(Arc::clone(&chunk))).await {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(_)) => {
                    debug!(peer_id = peer.id, addr = %peer.addr, "Peer writer gone, dropping peer");
                    self.unregister(peer.id);
                }
                Err(_) => {
                    warn!(peer_id = peer.id, addr = %peer.addr, "Peer not reading, dropping peer");
                    self.unregister(peer.id);
                }
            }
        }

        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    const WAIT: Duration = Duration::from_secs(5);

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let registry = PeerRegistry::new(10);
        let (a, _a_remote) = tokio::io::duplex(64);
        let (b, _b_remote) = tokio::io::duplex(64);

        let pa = registry.register(addr(), a).unwrap();
        let pb = registry.register(addr(), b).unwrap();
        assert_ne!(pa.id, pb.id);
        assert_eq!(registry.peer_count(), 2);

        let others: Vec<PeerId> = registry.snapshot_except(pa.id).iter().map(|p| p.id).collect();
        assert_eq!(others, vec![pb.id]);

        assert!(registry.unregister(pa.id).is_some());
        assert!(pa.is_closed());
        assert!(registry.unregister(pa.id).is_none());
        assert!(!registry.contains(pa.id));
        assert!(!pb.is_closed());
        assert_eq!(registry.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_register_when_full() {
        let registry = PeerRegistry::new(1);
        let (a, _a_remote) = tokio::io::duplex(64);
        let (b, _b_remote) = tokio::io::duplex(64);

        assert!(registry.register(addr(), a).is_ok());
        assert!(registry.register(addr(), b).is_err());
        assert_eq!(registry.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let registry = PeerRegistry::new(10);
        let (a, mut a_remote) = tokio::io::duplex(64);
        let (b, mut b_remote) = tokio::io::duplex(64);
        let (c, mut c_remote) = tokio::io::duplex(64);

        let pa = registry.register(addr(), a).unwrap();
        registry.register(addr(), b).unwrap();
        registry.register(addr(), c).unwrap();

        let delivered = registry.broadcast(pa.id, b"hello").await;
        assert_eq!(delivered, 2);

        let mut buf = [0u8; 5];
        b_remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        c_remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        // 发送者自己收不到；注销后写端关闭
        registry.unregister(pa.id);
        let mut sink = Vec::new();
        timeout(WAIT, a_remote.read_to_end(&mut sink)).await.unwrap().unwrap();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_closes_peer() {
        let registry = PeerRegistry::new(10);
        let (a, _a_remote) = tokio::io::duplex(64);
        let (b, b_remote) = tokio::io::duplex(64);
        let (c, mut c_remote) = tokio::io::duplex(64);

        let pa = registry.register(addr(), a).unwrap();
        let pb = registry.register(addr(), b).unwrap();
        let pc = registry.register(addr(), c).unwrap();

        drop(b_remote);
        registry.broadcast(pa.id, b"e2e4").await;

        // 写失败后读循环能收到通知
        timeout(WAIT, pb.closed()).await.unwrap();
        assert!(!pc.is_closed());

        let mut buf = [0u8; 4];
        c_remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"e2e4");

        // 写任务已退出，下一次广播把它移出连接表
        let delivered = registry.broadcast(pa.id, b"e7e5").await;
        assert_eq!(delivered, 1);
        assert!(!registry.contains(pb.id));
        assert!(registry.contains(pc.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_peer_is_dropped() {
        let registry = PeerRegistry::with_queue(10, 4, Duration::from_secs(1));
        let (a, _a_remote) = tokio::io::duplex(64);
        // 对端从不读取
        let (b, _b_remote) = tokio::io::duplex(16);
        let (c, mut c_remote) = tokio::io::duplex(4096);

        let pa = registry.register(addr(), a).unwrap();
        let pb = registry.register(addr(), b).unwrap();
        let pc = registry.register(addr(), c).unwrap();

        let chunk = [b'x'; 64];
        let mut sent = 0;
        while registry.contains(pb.id) {
            assert!(sent < 32, "stalled peer was never dropped");
            registry.broadcast(pa.id, &chunk).await;
            sent += 1;
        }

        assert!(pb.is_closed());
        assert!(registry.contains(pc.id));

        // 正常连接收到了全部数据
        let mut received = vec![0u8; sent * chunk.len()];
        c_remote.read_exact(&mut received).await.unwrap();
        assert!(received.iter().all(|&b| b == b'x'));
    }
}
