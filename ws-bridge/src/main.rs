use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use protocol::BridgeConfig;
use ws_bridge::BridgeServer;

/// 配置文件（可选）
const CONFIG_FILE: &str = "bridge.json";

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("ws_bridge=debug".parse()?))
        .init();

    let config = BridgeConfig::load_or_default(CONFIG_FILE)?;
    info!("桥接服务启动中: {:?}", config);

    let server = BridgeServer::bind(&config).await?;
    server.run().await?;

    Ok(())
}
