use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::credential::project::ProjectResolver;
use crate::credential::token::TokenProvider;
use crate::error::AppError;
use crate::pool::store::{AccountPool, SelectOutcome};
use crate::upstream::client::{ApiError, UpstreamClient};
use crate::upstream::types::{MessagesRequest, MessagesResponse};

/// 请求编排中枢：选号、解析凭证、调上游，失败按分类换号重试。
/// 流式与非流式共用同一套循环，流式只对握手阶段重试。
pub struct Dispatcher {
    pool: Arc<AccountPool>,
    tokens: Arc<TokenProvider>,
    projects: Arc<ProjectResolver>,
    upstream: Arc<UpstreamClient>,
    fallback_mode: bool,
    fallback_models: HashMap<String, String>,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<AccountPool>,
        tokens: Arc<TokenProvider>,
        projects: Arc<ProjectResolver>,
        upstream: Arc<UpstreamClient>,
        fallback_mode: bool,
        fallback_models: HashMap<String, String>,
    ) -> Self {
        Self {
            pool,
            tokens,
            projects,
            upstream,
            fallback_mode,
            fallback_models,
        }
    }

    pub fn pool(&self) -> &Arc<AccountPool> {
        &self.pool
    }

    pub fn tokens(&self) -> &Arc<TokenProvider> {
        &self.tokens
    }

    pub fn projects(&self) -> &Arc<ProjectResolver> {
        &self.projects
    }

    pub fn upstream(&self) -> &Arc<UpstreamClient> {
        &self.upstream
    }

    pub async fn send(&self, req: MessagesRequest) -> Result<MessagesResponse, AppError> {
        self.run(req, |client, project, token, req| async move {
            client.generate(&project, &token, &req).await
        })
        .await
    }

    /// 返回已握手成功的上游响应，事件流由调用方驱动。
    /// 握手之后的中断不再换号，由调用方补发终止事件。
    pub async fn send_stream(&self, req: MessagesRequest) -> Result<reqwest::Response, AppError> {
        self.run(req, |client, project, token, req| async move {
            client.generate_stream(&project, &token, &req).await
        })
        .await
    }

    async fn run<T, F, Fut>(&self, mut req: MessagesRequest, call: F) -> Result<T, AppError>
    where
        F: Fn(UpstreamClient, String, String, MessagesRequest) -> Fut,
        Fut: std::future::Future<Output = Result<T, ApiError>>,
    {
        let total = self.pool.len().await;
        if total == 0 {
            return Err(AppError::unavailable("账号池为空"));
        }

        // 乐观重置：上游真实窗口常比本地缓存的短，全体冷却时清表再试一轮。
        if self.pool.is_all_rate_limited(&req.model).await {
            tracing::warn!("模型 {} 所有账号均在冷却，乐观重置限流表", req.model);
            self.pool.reset_all_rate_limits().await;
        }

        // 每个账号至多尝试一次，循环必然终止。
        let mut excluded: HashSet<String> = HashSet::new();
        let mut last_err: Option<AppError> = None;

        for _ in 0..total {
            let account = match self.pool.select_for_model(&req.model, &excluded).await {
                SelectOutcome::Selected(account) => account,
                SelectOutcome::Wait { email, wait_ms } => {
                    // 只剩短冷却窗口且无替代账号：不在服务端睡等，把窗口报给客户端。
                    tracing::info!("账号 {email} 冷却中（剩余 {}ms），无替代账号", wait_ms);
                    return Err(AppError::RateLimited(humanize_wait(wait_ms)));
                }
                SelectOutcome::Exhausted => break,
            };

            let token = match self.tokens.resolve(&account).await {
                Ok(token) => token,
                Err(e @ AppError::AuthNetwork(_)) => {
                    // 传输层故障：账号无罪不排除，但本次请求直接失败。
                    return Err(e);
                }
                Err(e) => {
                    // 凭证被拒：TokenProvider 已标记失效，换下一个账号。
                    excluded.insert(account.email.clone());
                    last_err = Some(e);
                    continue;
                }
            };

            let project = self.projects.resolve(&account, &token).await;

            match call(
                self.upstream.as_ref().clone(),
                project,
                token,
                req.clone(),
            )
            .await
            {
                Ok(v) => {
                    self.pool.set_last_used(&account.email).await;
                    return Ok(v);
                }
                Err(e) if e.is_rate_limited() => {
                    let delay = e.retry_delay().and_then(|d| chrono::Duration::from_std(d).ok());
                    tracing::warn!("账号 {} 对模型 {} 限流: {e}", account.email, req.model);
                    self.pool
                        .mark_rate_limited(
                            &account.email,
                            delay,
                            Some(&req.model),
                            Some(e.to_string()),
                        )
                        .await;
                    excluded.insert(account.email.clone());

                    if self.fallback_mode
                        && let Some(fallback) = self.fallback_models.get(&req.model)
                    {
                        tracing::warn!("模型 {} 配额耗尽，降级到 {fallback}", req.model);
                        req.model = fallback.clone();
                    }
                    last_err = Some(AppError::RateLimited(e.to_string()));
                }
                Err(e) if e.is_auth_invalid() => {
                    tracing::warn!("账号 {} 凭证被上游拒绝: {e}", account.email);
                    self.pool.mark_invalid(&account.email, &e.to_string()).await;
                    self.tokens.invalidate(&account.email).await;
                    excluded.insert(account.email.clone());
                    last_err = Some(AppError::AuthInvalid(e.to_string()));
                }
                // 其余错误不属于换号能解决的范畴，首次出现即上抛。
                Err(e) => return Err(AppError::Anyhow(anyhow::anyhow!(e))),
            }
        }

        let snapshot = self.pool.snapshot().await;
        if !snapshot.is_empty() && snapshot.iter().all(|a| a.is_invalid) {
            return Err(AppError::AuthInvalid(
                "所有账号凭证均已失效".to_string(),
            ));
        }

        if let Some(err) = last_err {
            return Err(AppError::unavailable(format!(
                "已尝试 {} 个账号仍未成功，最后错误: {err}",
                excluded.len().max(1)
            )));
        }

        let wait_ms = self.pool.min_wait_ms(&req.model).await;
        if wait_ms > 0 {
            return Err(AppError::RateLimited(humanize_wait(wait_ms)));
        }
        Err(AppError::unavailable("没有可用账号"))
    }
}

fn humanize_wait(wait_ms: i64) -> String {
    let secs = (wait_ms + 999) / 1000;
    if secs >= 120 {
        format!("账号配额冷却中，约 {} 分钟后重置", (secs + 59) / 60)
    } else {
        format!("账号配额冷却中，约 {secs} 秒后重置")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, PoolConfig};
    use crate::credential::oauth::OauthClient;
    use crate::pool::types::{AccountConfig, PoolSettings};
    use crate::upstream::types::{Message, MessageContent, Role};

    fn config(accounts: Vec<AccountConfig>) -> Config {
        Config {
            host: "0.0.0.0".to_string(),
            port: 0,
            timeout_ms: 1000,
            proxy: String::new(),
            debug: "off".to_string(),
            oauth_client_id: String::new(),
            oauth_client_secret: String::new(),
            fallback_mode: false,
            fallback_models: HashMap::new(),
            pool: PoolConfig {
                accounts,
                settings: PoolSettings {
                    cooldown_seconds: 60,
                    short_wait_seconds: 120,
                    token_ttl_seconds: 3300,
                    initial_index: 0,
                },
            },
        }
    }

    fn dispatcher(cfg: Config) -> Dispatcher {
        let pool = Arc::new(AccountPool::new(cfg.pool.clone()));
        let oauth = Arc::new(OauthClient::new(&cfg).unwrap());
        let tokens = Arc::new(TokenProvider::new(oauth.clone(), pool.clone()));
        let projects = Arc::new(ProjectResolver::new(oauth));
        let upstream = Arc::new(UpstreamClient::new(&cfg).unwrap());
        Dispatcher::new(pool, tokens, projects, upstream, false, HashMap::new())
    }

    fn request(model: &str) -> MessagesRequest {
        MessagesRequest {
            model: model.to_string(),
            max_tokens: 64,
            messages: vec![Message {
                role: Role::User,
                content: MessageContent::Text("hi".to_string()),
            }],
            system: None,
            stream: None,
            temperature: None,
            top_p: None,
            stop_sequences: Vec::new(),
            tools: Vec::new(),
            tool_choice: None,
            thinking: None,
        }
    }

    #[tokio::test]
    async fn empty_pool_is_unavailable() {
        let d = dispatcher(config(vec![]));
        match d.send(request("m")).await {
            Err(AppError::UpstreamUnavailable(_)) => {}
            other => panic!("空池应返回不可用: {other:?}"),
        }
    }

    #[tokio::test]
    async fn all_invalid_fails_before_any_upstream_call() {
        let d = dispatcher(config(vec![
            AccountConfig::Manual {
                email: "a@x.com".to_string(),
                api_key: "k".to_string(),
                project_id: Some("p".to_string()),
            },
            AccountConfig::Manual {
                email: "b@x.com".to_string(),
                api_key: "k".to_string(),
                project_id: Some("p".to_string()),
            },
        ]));
        d.pool().mark_invalid("a@x.com", "revoked").await;
        d.pool().mark_invalid("b@x.com", "revoked").await;

        match d.send(request("m")).await {
            Err(AppError::AuthInvalid(_)) => {}
            other => panic!("全员失效应报认证类错误: {other:?}"),
        }
    }

    #[test]
    fn wait_message_is_humanized() {
        assert!(humanize_wait(90_000).contains("90 秒"));
        assert!(humanize_wait(30 * 60 * 1000).contains("30 分钟"));
    }
}
