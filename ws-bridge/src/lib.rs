//! WebSocket <-> TCP 走子桥接
//!
//! 每个 WebSocket 连接单独开一条到中继的 TCP 连接，
//! 两个方向同时转发并完成消息格式转换。

pub mod error;
pub mod server;
pub mod session;

pub use error::{BridgeError, Result};
pub use server::BridgeServer;
pub use session::{Session, SessionEnd, SessionId, SessionState};
