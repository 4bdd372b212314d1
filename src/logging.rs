//! 日志初始化

use std::str::FromStr;
use std::sync::Mutex;

use tracing::Level;

use crate::config::LoggingConfig;

/// 解析日志级别，无法识别时回退到 INFO
pub fn parse_level(level: &str) -> Level {
    Level::from_str(level.trim()).unwrap_or(Level::INFO)
}

/// 根据配置初始化全局 tracing subscriber
///
/// 配置了日志文件时写入文件（不带 ANSI 颜色），否则输出到 stdout。
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = parse_level(&config.level);

    if let Some(path) = &config.file {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;

        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .try_init()
            .map_err(|e| anyhow::anyhow!("初始化日志失败: {}", e))?;
    } else {
        tracing_subscriber::fmt()
            .with_max_level(level)
            .try_init()
            .map_err(|e| anyhow::anyhow!("初始化日志失败: {}", e))?;
    }

    Ok(())
}
