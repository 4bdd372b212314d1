//! HTTP 错误响应
//!
//! 所有错误统一返回 `{ "success": false, "error": "..." }`。
//! 服务器内部错误只在日志中记录详情，响应里只给出通用信息。

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::session_files::StorageError;

pub const INTERNAL_ERROR_MESSAGE: &str = "internal server error";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 缺少必填字段
    pub fn missing(field: &str) -> Self {
        Self::BadRequest(format!("{} is required", field))
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidInput(msg) => Self::BadRequest(msg),
            StorageError::NotFound(msg) => Self::NotFound(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error = match self {
            Self::Internal(detail) => {
                tracing::error!("[API] 服务器内部错误: {}", detail);
                INTERNAL_ERROR_MESSAGE.to_string()
            }
            Self::BadRequest(msg) | Self::NotFound(msg) => msg,
        };
        (
            status,
            Json(ErrorBody {
                success: false,
                error,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_mapping() {
        let err: ApiError = StorageError::InvalidInput("bad".to_string()).into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err: ApiError = StorageError::NotFound("gone".to_string()).into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "/secret/path");
        let err: ApiError = StorageError::Io {
            context: "写入草图失败".to_string(),
            source: io,
        }
        .into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_internal_error_hides_detail() {
        let response = ApiError::Internal("/secret/path: permission denied".to_string())
            .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], INTERNAL_ERROR_MESSAGE);
    }
}
