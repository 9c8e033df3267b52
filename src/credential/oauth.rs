use reqwest::header::{CONTENT_TYPE, HOST};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::config::Config;

const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

#[derive(Debug, Clone, serde::Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    pub expires_in: i32,
}

/// 刷新失败的两类结局，决定账号是否被移出轮换：
/// Network 是传输层故障（账号无罪），Rejected 是身份提供方明确拒绝。
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("网络错误: {0}")]
    Network(String),
    #[error("{0}")]
    Rejected(String),
}

/// 与身份提供方交互的 HTTP 客户端，进程内构造一份共享。
pub struct OauthClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
}

impl OauthClient {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            // OAuth 端点在 HTTP/2 下偶发 PROTOCOL_ERROR 导致刷新失败，强制 HTTP/1。
            .http1_only();

        if cfg.timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(cfg.timeout_ms));
        }
        if !cfg.proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }

        Ok(Self {
            http: builder.build()?,
            client_id: cfg.effective_oauth_client_id().to_string(),
            client_secret: cfg.effective_oauth_client_secret().to_string(),
        })
    }

    /// 发现端点等非 OAuth 请求复用同一个连接池。
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// refresh token 换 access token。身份提供方可能同时轮换 refresh token，
    /// 返回体里带新值时由调用方写回账号记录。
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, RefreshError> {
        if refresh_token.trim().is_empty() {
            return Err(RefreshError::Rejected("缺少 refresh_token".to_string()));
        }

        let resp = self
            .http
            .post(TOKEN_ENDPOINT)
            .header(HOST, "oauth2.googleapis.com")
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(|e| RefreshError::Network(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| RefreshError::Network(e.to_string()))?;
        if body.len() > (1 << 20) {
            return Err(RefreshError::Rejected("OAuth 响应过大".to_string()));
        }

        if !status.is_success() {
            let text = String::from_utf8_lossy(&body);
            warn!("OAuth 刷新 token 失败（HTTP {}）：{text}", status.as_u16());
            return Err(RefreshError::Rejected(format!(
                "刷新 Token 失败（HTTP {}）",
                status.as_u16()
            )));
        }

        sonic_rs::from_slice::<TokenResponse>(&body)
            .map_err(|e| RefreshError::Rejected(format!("OAuth 响应解析失败: {e}")))
    }
}
