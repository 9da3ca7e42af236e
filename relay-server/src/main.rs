use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use protocol::RelayConfig;
use relay_server::RelayServer;

/// 配置文件（可选）
const CONFIG_FILE: &str = "relay.json";

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("relay_server=debug".parse()?))
        .init();

    let config = RelayConfig::load_or_default(CONFIG_FILE)?;
    info!("中继服务启动中: {:?}", config);

    let server = RelayServer::bind(&config).await?;
    server.run().await?;

    Ok(())
}
