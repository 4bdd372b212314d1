use anyhow::Context;
use tokio::sync::oneshot;

use sketchcast_lib::{config, logging, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::load_config().context("加载配置失败")?;
    logging::init_logging(&config.logging)?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("收到退出信号，正在关闭服务器");
            let _ = shutdown_tx.send(());
        }
    });

    server::run_server(config, shutdown_rx)
        .await
        .map_err(|e| anyhow::anyhow!("服务器异常退出: {}", e))
}
