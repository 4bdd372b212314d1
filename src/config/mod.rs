//! 配置管理模块
//!
//! 提供 YAML 配置文件支持。配置在启动时加载一次，
//! 之后以 `Config` 对象的形式显式传递给各个组件。

mod types;
mod yaml;

pub use types::{
    Config, LoggingConfig, MergeConfig, ServerConfig, StorageConfig, DEFAULT_BODY_LIMIT_MB,
    DEFAULT_HOST, DEFAULT_PORT, DEFAULT_UPLOAD_ROOT,
};
pub use yaml::{load_config, load_config_from_path, ConfigError, CONFIG_ENV_VAR};

#[cfg(test)]
mod tests;
