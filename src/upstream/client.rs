use reqwest::header::{ACCEPT_ENCODING, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use sonic_rs::JsonValueTrait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::config::Config;
use crate::logging::{self, LogLevel};

use super::types::{MessagesRequest, MessagesResponse};

const DEFAULT_UPSTREAM_HOST: &str = "cloudcode-pa.googleapis.com";

#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            host: DEFAULT_UPSTREAM_HOST.to_string(),
        }
    }
}

impl Endpoint {
    pub fn generate_url(&self) -> String {
        format!("https://{}/v1internal:generateMessage", self.host)
    }

    pub fn stream_url(&self) -> String {
        format!(
            "https://{}/v1internal:streamGenerateMessage?alt=sse",
            self.host
        )
    }

    pub fn quota_url(&self) -> String {
        format!("https://{}/v1internal:fetchQuota", self.host)
    }

    pub fn models_url(&self) -> String {
        format!("https://{}/v1internal:fetchAvailableModels", self.host)
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("上游 API 错误 {status}: {message}")]
    Http {
        status: u16,
        message: String,
        retry_delay: Duration,
        rate_limited: bool,
        auth_invalid: bool,
    },

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] sonic_rs::Error),
}

impl ApiError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Http { rate_limited: true, .. })
    }

    pub fn is_auth_invalid(&self) -> bool {
        matches!(self, Self::Http { auth_invalid: true, .. })
    }

    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::Http { retry_delay, .. } if *retry_delay != Duration::ZERO => Some(*retry_delay),
            _ => None,
        }
    }
}

/// 请求体外层：中立请求裹上项目元数据。
#[derive(Debug, serde::Serialize)]
struct GenerateEnvelope<'a> {
    project: &'a str,
    request: &'a MessagesRequest,
}

#[derive(Debug, serde::Serialize)]
struct ProjectPayload<'a> {
    project: &'a str,
}

/// 配额查询结果：remaining_fraction 取值 0~1，未知为 None。
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelQuota {
    #[serde(default)]
    pub remaining_fraction: Option<f64>,
    #[serde(default)]
    pub reset_time: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct QuotaResponse {
    #[serde(default)]
    models: HashMap<String, ModelQuota>,
}

#[derive(Debug, serde::Deserialize)]
struct AvailableModelsResponse {
    #[serde(default)]
    models: HashMap<String, sonic_rs::Value>,
}

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    http_stream: reqwest::Client,
    endpoint: Endpoint,
    log_level: LogLevel,
}

impl UpstreamClient {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        // 非流式/配额请求维持 HTTP/1.1，仅流式接口走 HTTP/2（SSE）。
        let mut http1_builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .http1_only();
        let mut http2_builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .http2_prior_knowledge();

        if cfg.timeout_ms > 0 {
            let t = Duration::from_millis(cfg.timeout_ms);
            http1_builder = http1_builder.timeout(t);
            http2_builder = http2_builder.timeout(t);
        }
        if !cfg.proxy.trim().is_empty() {
            // Proxy 不保证可 Clone，这里各自构建一次避免 trait 约束。
            http1_builder = http1_builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
            http2_builder = http2_builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }

        Ok(Self {
            http: http1_builder.build()?,
            http_stream: http2_builder.build()?,
            endpoint: Endpoint::default(),
            log_level: cfg.log_level(),
        })
    }

    fn build_headers(&self, access_token: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {access_token}"))
                .unwrap_or(HeaderValue::from_static("")),
        );
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        h.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        h
    }

    pub async fn generate(
        &self,
        project: &str,
        access_token: &str,
        req: &MessagesRequest,
    ) -> Result<MessagesResponse, ApiError> {
        let url = self.endpoint.generate_url();
        let body = sonic_rs::to_vec(&GenerateEnvelope { project, request: req })?;
        if self.log_level.backend_enabled() {
            logging::backend_request("POST", &url, &body);
        }

        let start = std::time::Instant::now();
        let resp = self
            .http
            .post(&url)
            .headers(self.build_headers(access_token))
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let bytes = resp.bytes().await?;
        if self.log_level.backend_enabled() {
            logging::backend_response(status.as_u16(), start.elapsed(), &bytes);
        }
        if !status.is_success() {
            return Err(extract_error_details(status.as_u16(), &bytes));
        }
        Ok(sonic_rs::from_slice::<MessagesResponse>(&bytes)?)
    }

    /// 只负责握手；握手失败返回分类后的错误供 Dispatcher 换号重试，
    /// 成功后的字节流交给 upstream::stream 消费。
    pub async fn generate_stream(
        &self,
        project: &str,
        access_token: &str,
        req: &MessagesRequest,
    ) -> Result<reqwest::Response, ApiError> {
        let url = self.endpoint.stream_url();
        let body = sonic_rs::to_vec(&GenerateEnvelope { project, request: req })?;
        if self.log_level.backend_enabled() {
            logging::backend_request("POST", &url, &body);
        }

        let mut headers = self.build_headers(access_token);
        headers.remove(ACCEPT_ENCODING);

        let resp = self
            .http_stream
            .post(&url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let bytes = resp.bytes().await?;
            if self.log_level.backend_enabled() {
                logging::backend_response(status.as_u16(), Duration::ZERO, &bytes);
            }
            return Err(extract_error_details(status.as_u16(), &bytes));
        }
        Ok(resp)
    }

    pub async fn fetch_quota(
        &self,
        project: &str,
        access_token: &str,
    ) -> Result<HashMap<String, ModelQuota>, ApiError> {
        let url = self.endpoint.quota_url();
        let body = sonic_rs::to_vec(&ProjectPayload { project })?;
        let resp = self
            .http
            .post(&url)
            .headers(self.build_headers(access_token))
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            return Err(extract_error_details(status.as_u16(), &bytes));
        }
        Ok(sonic_rs::from_slice::<QuotaResponse>(&bytes)?.models)
    }

    pub async fn fetch_models(
        &self,
        project: &str,
        access_token: &str,
    ) -> Result<Vec<String>, ApiError> {
        let url = self.endpoint.models_url();
        let body = sonic_rs::to_vec(&ProjectPayload { project })?;
        let resp = self
            .http
            .post(&url)
            .headers(self.build_headers(access_token))
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            return Err(extract_error_details(status.as_u16(), &bytes));
        }
        let decoded = sonic_rs::from_slice::<AvailableModelsResponse>(&bytes)?;
        let mut models: Vec<String> = decoded.models.into_keys().collect();
        models.sort();
        Ok(models)
    }
}

/// 把上游错误体解析成分类后的 ApiError：
/// RESOURCE_EXHAUSTED / 429 视为限流，UNAUTHENTICATED / 401 / 403 视为凭证失效，
/// RetryInfo 里的 retryDelay 直接喂给冷却时长。
pub fn extract_error_details(status: u16, body: &[u8]) -> ApiError {
    #[derive(Debug, serde::Deserialize)]
    struct ErrResp {
        error: ErrInner,
    }

    #[derive(Debug, serde::Deserialize)]
    struct ErrInner {
        #[serde(default)]
        code: Option<sonic_rs::Value>,
        #[serde(default)]
        message: String,
        #[serde(default)]
        status: String,
        #[serde(default)]
        details: Vec<ErrDetail>,
    }

    #[derive(Debug, serde::Deserialize)]
    struct ErrDetail {
        #[serde(rename = "@type", default)]
        ty: String,
        #[serde(rename = "retryDelay", default)]
        retry_delay: String,
    }

    let mut out_status = status;
    let mut message = "Unknown error".to_string();
    let mut retry_delay = Duration::ZERO;

    if let Ok(err_resp) = sonic_rs::from_slice::<ErrResp>(body) {
        let err = err_resp.error;
        if !err.message.is_empty() {
            message = err.message;
        }

        let code_str = err
            .code
            .as_ref()
            .and_then(|c| c.as_str())
            .map(|s| s.to_uppercase())
            .unwrap_or_default();
        let status_str = err.status.to_uppercase();

        if code_str == "RESOURCE_EXHAUSTED" || status_str == "RESOURCE_EXHAUSTED" {
            out_status = 429;
        } else if code_str == "UNAUTHENTICATED" || status_str == "UNAUTHENTICATED" {
            out_status = 401;
        } else if let Some(i) = err.code.as_ref().and_then(|c| c.as_i64())
            && i > 0
            && i <= u16::MAX as i64
        {
            out_status = i as u16;
        }

        for d in err.details {
            if d.ty.contains("RetryInfo")
                && let Some(delay) = parse_retry_delay_seconds(&d.retry_delay)
            {
                retry_delay = delay;
            }
        }
    }

    ApiError::Http {
        status: out_status,
        message,
        retry_delay,
        rate_limited: out_status == 429,
        auth_invalid: out_status == 401 || out_status == 403,
    }
}

fn parse_retry_delay_seconds(s: &str) -> Option<Duration> {
    // 兼容形如 "2s" / "2.5s" / "0.123s"
    let s = s.trim();
    let s = s.strip_suffix('s')?;
    let secs: f64 = s.trim().parse().ok()?;
    if !(secs.is_finite() && secs >= 0.0) {
        return None;
    }
    Some(Duration::from_secs_f64(secs))
}
