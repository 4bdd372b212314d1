//! YAML 配置加载

use std::path::{Path, PathBuf};

use super::types::Config;

/// 指定配置文件路径的环境变量
pub const CONFIG_ENV_VAR: &str = "SKETCHCAST_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("读取配置文件失败 {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("解析配置文件失败: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("配置无效: {0}")]
    Invalid(String),
}

/// 默认配置文件路径：~/.sketchcast/config.yaml
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".sketchcast").join("config.yaml"))
}

/// 加载配置
///
/// 查找顺序：`SKETCHCAST_CONFIG` 环境变量 → 默认路径 → 内置默认值。
/// 环境变量指向的文件必须存在；默认路径下的文件缺失时使用默认值。
pub fn load_config() -> Result<Config, ConfigError> {
    let env_path = std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from);
    resolve_config(env_path.as_deref(), default_config_path().as_deref())
}

/// 按查找顺序解析配置：显式路径优先，其次是存在的默认路径
pub(super) fn resolve_config(
    explicit: Option<&Path>,
    default_path: Option<&Path>,
) -> Result<Config, ConfigError> {
    if let Some(path) = explicit {
        return load_config_from_path(path);
    }

    match default_path {
        Some(path) if path.exists() => load_config_from_path(path),
        _ => {
            tracing::debug!("[CONFIG] 未找到配置文件，使用默认配置");
            Ok(Config::default())
        }
    }
}

/// 从指定路径加载配置
pub fn load_config_from_path(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse_config(&content)?;
    tracing::info!("[CONFIG] 已加载配置文件: {:?}", path);
    Ok(config)
}

pub(super) fn parse_config(content: &str) -> Result<Config, ConfigError> {
    // 空文件视为全部使用默认值
    let config: Config = if content.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(content)?
    };
    config.validate().map_err(ConfigError::Invalid)?;
    Ok(config)
}
