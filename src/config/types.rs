//! 配置类型定义

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_UPLOAD_ROOT: &str = "uploads";
pub const DEFAULT_BODY_LIMIT_MB: usize = 100;

/// 主配置
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// HTTP 服务器配置
    pub server: ServerConfig,
    /// 存储配置
    pub storage: StorageConfig,
    /// 音频合并配置
    pub merge: MergeConfig,
    /// 日志配置
    pub logging: LoggingConfig,
}

impl Config {
    /// 校验配置
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port 不能为 0".to_string());
        }
        if self.server.host.trim().is_empty() {
            return Err("server.host 不能为空".to_string());
        }
        if self.storage.upload_root.as_os_str().is_empty() {
            return Err("storage.upload_root 不能为空".to_string());
        }
        if self.server.body_limit_mb == 0 {
            return Err("server.body_limit_mb 必须大于 0".to_string());
        }
        Ok(())
    }
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// 监听地址
    pub host: String,
    /// 监听端口
    pub port: u16,
    /// 请求体大小上限（MB），音频分片走 multipart，需要足够大
    pub body_limit_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            body_limit_mb: DEFAULT_BODY_LIMIT_MB,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn body_limit_bytes(&self) -> usize {
        self.body_limit_mb * 1024 * 1024
    }
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// 上传根目录，每个会话在其下拥有独立子目录
    pub upload_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_root: PathBuf::from(DEFAULT_UPLOAD_ROOT),
        }
    }
}

/// 音频合并配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MergeConfig {
    /// 是否尝试使用 ffmpeg；关闭后直接走字节拼接
    pub ffmpeg_enabled: bool,
    /// ffmpeg 可执行文件路径，默认在 PATH 中查找
    pub ffmpeg_path: PathBuf,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_enabled: true,
            ffmpeg_path: PathBuf::from("ffmpeg"),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别（trace, debug, info, warn, error）
    pub level: String,
    /// 日志文件路径，未设置时输出到 stdout
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}
