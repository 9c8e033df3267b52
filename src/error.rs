use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// 网关统一错误分类。
///
/// Dispatcher 只对 RateLimited / AuthInvalid 做跨账号重试，
/// 其余分类首次出现即透传到 HTTP 边界。
#[derive(Debug, Error)]
pub enum AppError {
    /// 刷新凭证时的网络/传输故障：账号本身无罪，不移出轮换。
    #[error("凭证刷新网络错误: {0}")]
    AuthNetwork(String),

    /// 凭证被上游永久拒绝（bad grant / 已吊销）。
    #[error("上游凭证已失效: {0}")]
    AuthInvalid(String),

    /// 账号+模型配额耗尽。消息中附带可读的重置窗口。
    #[error("配额已用尽: {0}")]
    RateLimited(String),

    #[error("参数错误: {0}")]
    InvalidArgument(String),

    /// 所有账号轮换完仍无法完成请求。
    #[error("没有可用的上游账号: {0}")]
    UpstreamUnavailable(String),

    #[error("暂未实现: {0}")]
    NotImplemented(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorBodyInner,
}

#[derive(Debug, Serialize)]
struct ErrorBodyInner {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    r#type: Option<String>,
}

impl AppError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::AuthNetwork(_) => StatusCode::BAD_GATEWAY,
            AppError::AuthInvalid(_) => StatusCode::UNAUTHORIZED,
            // 故意不用 429/503：避免客户端按“可重试”语义发起重试风暴，
            // 重置窗口已写进 message。
            AppError::RateLimited(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            AppError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            AppError::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn type_tag(&self) -> &'static str {
        match self {
            AppError::AuthNetwork(_) => "auth_network",
            AppError::AuthInvalid(_) => "auth_invalid",
            AppError::RateLimited(_) => "rate_limited",
            AppError::InvalidArgument(_) => "invalid_argument",
            AppError::UpstreamUnavailable(_) => "upstream_unavailable",
            AppError::NotImplemented(_) => "not_implemented",
            AppError::Anyhow(_) => "internal",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: ErrorBodyInner {
                message: self.to_string(),
                r#type: Some(self.type_tag().to_string()),
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_maps_to_non_retry_status() {
        let err = AppError::RateLimited("约 120 秒后重置".to_string());
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn not_implemented_maps_to_501() {
        let err = AppError::NotImplemented("count_tokens".to_string());
        assert_eq!(err.status(), StatusCode::NOT_IMPLEMENTED);
    }
}
