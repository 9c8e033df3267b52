use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

use crate::error::AppError;
use crate::pool::store::AccountPool;
use crate::pool::types::{Account, Credential};

use super::oauth::{OauthClient, RefreshError};

/// access token 解析器：按邮箱缓存，TTL 内不回源。
/// 并发打到同一账号时由 moka 的 try_get_with 合并成一次刷新。
pub struct TokenProvider {
    cache: Cache<String, String>,
    oauth: Arc<OauthClient>,
    pool: Arc<AccountPool>,
}

impl TokenProvider {
    pub fn new(oauth: Arc<OauthClient>, pool: Arc<AccountPool>) -> Self {
        let ttl = pool.settings().token_ttl_seconds;
        Self {
            cache: Cache::builder()
                .max_capacity(1024)
                .time_to_live(Duration::from_secs(ttl))
                .build(),
            oauth,
            pool,
        }
    }

    pub async fn resolve(&self, account: &Account) -> Result<String, AppError> {
        let refresh_token = match &account.credential {
            Credential::Manual { api_key } => {
                // 静态密钥解析必然成功；被标记失效的账号借此恢复轮换资格。
                if account.is_invalid {
                    self.pool.clear_invalid(&account.email).await;
                }
                return Ok(api_key.clone());
            }
            Credential::Oauth { refresh_token } => refresh_token.clone(),
        };

        let email = account.email.clone();
        let oauth = self.oauth.clone();
        let pool = self.pool.clone();

        let result = self
            .cache
            .try_get_with(email.clone(), async move {
                let token = oauth.refresh(&refresh_token).await?;
                if !token.refresh_token.is_empty() {
                    pool.update_refresh_token(&email, &token.refresh_token).await;
                }
                tracing::info!("已刷新 Token：{email}");
                Ok::<String, RefreshError>(token.access_token)
            })
            .await;

        match result {
            Ok(token) => {
                // 解析成功即恢复轮换资格（含缓存命中）。
                if account.is_invalid {
                    self.pool.clear_invalid(&account.email).await;
                }
                Ok(token)
            }
            Err(e) => match e.as_ref() {
                RefreshError::Network(msg) => Err(AppError::AuthNetwork(msg.clone())),
                RefreshError::Rejected(msg) => {
                    self.pool.mark_invalid(&account.email, msg).await;
                    Err(AppError::AuthInvalid(msg.clone()))
                }
            },
        }
    }

    pub async fn invalidate(&self, email: &str) {
        self.cache.invalidate(email).await;
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, PoolConfig};
    use crate::pool::types::{AccountConfig, PoolSettings};
    use std::collections::HashMap;

    fn fixture() -> (TokenProvider, Account) {
        let cfg = Config {
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
                accounts: vec![AccountConfig::Manual {
                    email: "a@x.com".to_string(),
                    api_key: "sk-static".to_string(),
                    project_id: None,
                }],
                settings: PoolSettings {
                    cooldown_seconds: 60,
                    short_wait_seconds: 120,
                    token_ttl_seconds: 3300,
                    initial_index: 0,
                },
            },
        };
        let oauth = Arc::new(OauthClient::new(&cfg).unwrap());
        let pool = Arc::new(AccountPool::new(cfg.pool));
        let provider = TokenProvider::new(oauth, pool);
        let account = Account::from_config(AccountConfig::Manual {
            email: "a@x.com".to_string(),
            api_key: "sk-static".to_string(),
            project_id: None,
        });
        (provider, account)
    }

    #[tokio::test]
    async fn manual_accounts_bypass_the_cache() {
        let (provider, account) = fixture();
        let token = provider.resolve(&account).await.unwrap();
        assert_eq!(token, "sk-static");
    }

    #[tokio::test]
    async fn successful_resolution_restores_an_invalid_account() {
        let (provider, _) = fixture();
        provider.pool.mark_invalid("a@x.com", "上游 401").await;
        let account = provider.pool.snapshot().await.into_iter().next().unwrap();
        assert!(account.is_invalid);

        provider.resolve(&account).await.unwrap();

        let account = provider.pool.snapshot().await.into_iter().next().unwrap();
        assert!(!account.is_invalid);
        assert!(account.invalid_reason.is_none());
    }
}
