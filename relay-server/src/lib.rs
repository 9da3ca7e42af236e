//! TCP 走子中继服务端
//!
//! 包含:
//! - 连接表 (PeerRegistry)
//! - 广播转发服务器 (RelayServer)

pub mod peer;
pub mod server;

pub use peer::{PeerHandle, PeerId, PeerRegistry};
pub use server::RelayServer;
