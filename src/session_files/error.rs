use std::io;

/// 会话文件存储错误
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// 客户端输入不合法（缺少字段、非法字符等）
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("元数据序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let context = context.into();
        move |source| Self::Io { context, source }
    }
}
