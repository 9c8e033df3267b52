use moka::future::Cache;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use std::sync::Arc;

use crate::pool::types::Account;

use super::oauth::OauthClient;

/// 发现端点按顺序兜底，第一个成功的结果生效。
const DISCOVERY_BASES: [&str; 2] = [
    "https://cloudcode-pa.googleapis.com",
    "https://daily-cloudcode-pa.sandbox.googleapis.com",
];

/// 所有发现途径都失败时的保底项目 id：请求仍能发出，属降级而非致命。
const DEFAULT_PROJECT_ID: &str = "charged-mind-4h2cb";

#[derive(Debug, serde::Deserialize)]
struct DiscoveryResponse {
    #[serde(rename = "cloudaicompanionProject", default)]
    cloud_ai_companion_project: String,
}

/// 项目 id 解析：配置值优先，其次永久缓存，再走发现端点，最后固定默认值。
pub struct ProjectResolver {
    cache: Cache<String, String>,
    oauth: Arc<OauthClient>,
}

impl ProjectResolver {
    pub fn new(oauth: Arc<OauthClient>) -> Self {
        Self {
            cache: Cache::builder().max_capacity(1024).build(),
            oauth,
        }
    }

    pub async fn resolve(&self, account: &Account, access_token: &str) -> String {
        if let Some(configured) = account.project_id.as_deref()
            && !configured.trim().is_empty()
        {
            return configured.trim().to_string();
        }

        if let Some(cached) = self.cache.get(&account.email).await {
            return cached;
        }

        for base in DISCOVERY_BASES {
            match self.discover(base, access_token).await {
                Ok(pid) if !pid.trim().is_empty() => {
                    let pid = pid.trim().to_string();
                    self.cache.insert(account.email.clone(), pid.clone()).await;
                    return pid;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("发现端点 {base} 失败: {e}");
                }
            }
        }

        tracing::warn!(
            "账号 {} 未能发现项目 id，降级使用默认值 {DEFAULT_PROJECT_ID}",
            account.email
        );
        DEFAULT_PROJECT_ID.to_string()
    }

    async fn discover(&self, base: &str, access_token: &str) -> anyhow::Result<String> {
        let resp = self
            .oauth
            .http()
            .post(format!("{base}/v1internal:loadCodeAssist"))
            .header(AUTHORIZATION, format!("Bearer {access_token}"))
            .header(CONTENT_TYPE, "application/json")
            .body(r#"{"metadata":{"pluginType":"GEMINI"}}"#)
            .send()
            .await?;

        if !resp.status().is_success() {
            anyhow::bail!("HTTP {}", resp.status().as_u16());
        }

        let body = resp.bytes().await?;
        if body.len() > (1 << 20) {
            anyhow::bail!("响应过大");
        }

        let decoded = sonic_rs::from_slice::<DiscoveryResponse>(&body)?;
        Ok(decoded.cloud_ai_companion_project)
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}
