use chrono::{Duration, Utc};
use std::collections::HashSet;
use tokio::sync::RwLock;

use crate::config::PoolConfig;

use super::ratelimit;
use super::selector::{self, Selection};
use super::types::{Account, Credential, PoolSettings};

/// 账号池：进程内唯一一份显式构造的调度状态，
/// 轮换指针和限流表都收在同一把写锁后面。
pub struct AccountPool {
    state: RwLock<State>,
    settings: PoolSettings,
}

struct State {
    accounts: Vec<Account>,
    current_index: usize,
}

/// select_for_model 对外的三种结局：
/// 选中某个账号、只剩短冷却窗口（带剩余毫秒）、彻底无号可用。
#[derive(Debug)]
pub enum SelectOutcome {
    Selected(Account),
    Wait { email: String, wait_ms: i64 },
    Exhausted,
}

impl AccountPool {
    pub fn new(cfg: PoolConfig) -> Self {
        let accounts: Vec<Account> = cfg
            .accounts
            .into_iter()
            .map(Account::from_config)
            .collect();
        let current_index = if accounts.is_empty() {
            0
        } else {
            cfg.settings.initial_index % accounts.len()
        };
        Self {
            state: RwLock::new(State {
                accounts,
                current_index,
            }),
            settings: cfg.settings,
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.accounts.len()
    }

    pub async fn snapshot(&self) -> Vec<Account> {
        self.state.read().await.accounts.clone()
    }

    /// 为目标模型选号。指针账号落在短冷却窗口时先尝试把它排除后再选一轮，
    /// 只有确实没有替代账号时才把等待上抛。
    pub async fn select_for_model(&self, model: &str, exclude: &HashSet<String>) -> SelectOutcome {
        let short_wait_ms = (self.settings.short_wait_seconds * 1000) as i64;
        let mut state = self.state.write().await;
        ratelimit::clear_expired(&mut state.accounts);

        match selector::select(
            &state.accounts,
            state.current_index,
            model,
            exclude,
            short_wait_ms,
        ) {
            Selection::Stick(idx) => SelectOutcome::Selected(state.accounts[idx].clone()),
            Selection::Rotate(idx) => {
                state.current_index = idx;
                SelectOutcome::Selected(state.accounts[idx].clone())
            }
            Selection::Wait { index, wait_ms } => {
                let sticky_email = state.accounts[index].email.clone();
                let mut widened = exclude.clone();
                widened.insert(sticky_email.clone());
                match selector::select(
                    &state.accounts,
                    state.current_index,
                    model,
                    &widened,
                    short_wait_ms,
                ) {
                    Selection::Stick(idx) | Selection::Rotate(idx) => {
                        state.current_index = idx;
                        SelectOutcome::Selected(state.accounts[idx].clone())
                    }
                    _ => SelectOutcome::Wait {
                        email: sticky_email,
                        wait_ms,
                    },
                }
            }
            Selection::Exhausted => SelectOutcome::Exhausted,
        }
    }

    /// delay 为 None 时使用配置的默认冷却。
    pub async fn mark_rate_limited(
        &self,
        email: &str,
        delay: Option<Duration>,
        model: Option<&str>,
        reason: Option<String>,
    ) {
        let delay = delay.unwrap_or_else(|| Duration::seconds(self.settings.cooldown_seconds as i64));
        let mut state = self.state.write().await;
        if let Some(account) = state.accounts.iter_mut().find(|a| a.email == email) {
            ratelimit::mark_rate_limited(account, delay, model, reason);
        }
    }

    pub async fn mark_invalid(&self, email: &str, reason: &str) {
        let mut state = self.state.write().await;
        if let Some(account) = state.accounts.iter_mut().find(|a| a.email == email) {
            ratelimit::mark_invalid(account, reason);
        }
    }

    pub async fn clear_invalid(&self, email: &str) {
        let mut state = self.state.write().await;
        if let Some(account) = state.accounts.iter_mut().find(|a| a.email == email) {
            ratelimit::clear_invalid(account);
        }
    }

    pub async fn set_last_used(&self, email: &str) {
        let mut state = self.state.write().await;
        if let Some(account) = state.accounts.iter_mut().find(|a| a.email == email) {
            account.last_used = Some(Utc::now());
        }
    }

    /// 身份提供方轮换了 refresh token 时写回内存记录。
    pub async fn update_refresh_token(&self, email: &str, new_token: &str) {
        let mut state = self.state.write().await;
        if let Some(account) = state.accounts.iter_mut().find(|a| a.email == email)
            && let Credential::Oauth { refresh_token } = &mut account.credential
            && refresh_token != new_token
        {
            *refresh_token = new_token.to_string();
            tracing::info!("账号 {email} 的 refresh token 已轮换");
        }
    }

    pub async fn is_all_rate_limited(&self, model: &str) -> bool {
        let mut state = self.state.write().await;
        ratelimit::clear_expired(&mut state.accounts);
        ratelimit::is_all_rate_limited(&state.accounts, model)
    }

    pub async fn min_wait_ms(&self, model: &str) -> i64 {
        let state = self.state.read().await;
        ratelimit::min_wait_ms(&state.accounts, model)
    }

    /// 乐观重置：上游真实窗口常比本地缓存的短，全体限流时清表重试一次。
    pub async fn reset_all_rate_limits(&self) {
        let mut state = self.state.write().await;
        ratelimit::reset_all(&mut state.accounts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::types::{AccountConfig, PoolSettings};

    fn pool(accounts: Vec<AccountConfig>) -> AccountPool {
        AccountPool::new(PoolConfig {
            accounts,
            settings: PoolSettings {
                cooldown_seconds: 60,
                short_wait_seconds: 120,
                token_ttl_seconds: 3300,
                initial_index: 0,
            },
        })
    }

    fn manual(email: &str) -> AccountConfig {
        AccountConfig::Manual {
            email: email.to_string(),
            api_key: "k".to_string(),
            project_id: None,
        }
    }

    #[tokio::test]
    async fn short_cooldown_rotates_when_alternative_exists() {
        // A 还有 90 秒冷却，B 空闲：不等待，直接选 B。
        let pool = pool(vec![manual("a@x.com"), manual("b@x.com")]);
        pool.mark_rate_limited("a@x.com", Some(Duration::seconds(90)), Some("m"), None)
            .await;

        match pool.select_for_model("m", &HashSet::new()).await {
            SelectOutcome::Selected(account) => assert_eq!(account.email, "b@x.com"),
            other => panic!("应选中 B: {other:?}"),
        }
    }

    #[tokio::test]
    async fn short_cooldown_without_alternative_reports_wait() {
        let pool = pool(vec![manual("a@x.com")]);
        pool.mark_rate_limited("a@x.com", Some(Duration::seconds(90)), Some("m"), None)
            .await;

        match pool.select_for_model("m", &HashSet::new()).await {
            SelectOutcome::Wait { email, wait_ms } => {
                assert_eq!(email, "a@x.com");
                assert!(wait_ms > 0 && wait_ms <= 90_000);
            }
            other => panic!("应报告等待: {other:?}"),
        }
    }

    #[tokio::test]
    async fn long_cooldown_single_account_is_exhausted() {
        let pool = pool(vec![manual("a@x.com")]);
        pool.mark_rate_limited("a@x.com", Some(Duration::minutes(30)), Some("m"), None)
            .await;

        assert!(matches!(
            pool.select_for_model("m", &HashSet::new()).await,
            SelectOutcome::Exhausted
        ));
        assert!(pool.is_all_rate_limited("m").await);
    }

    #[tokio::test]
    async fn optimistic_reset_restores_selection() {
        let pool = pool(vec![manual("a@x.com")]);
        pool.mark_rate_limited("a@x.com", Some(Duration::minutes(30)), Some("m"), None)
            .await;
        pool.reset_all_rate_limits().await;
        assert!(matches!(
            pool.select_for_model("m", &HashSet::new()).await,
            SelectOutcome::Selected(_)
        ));
    }

    #[tokio::test]
    async fn refresh_token_rotation_writes_back() {
        let pool = pool(vec![AccountConfig::Oauth {
            email: "a@x.com".to_string(),
            refresh_token: "rt-old".to_string(),
            project_id: None,
        }]);
        pool.update_refresh_token("a@x.com", "rt-new").await;
        let snapshot = pool.snapshot().await;
        match &snapshot[0].credential {
            Credential::Oauth { refresh_token } => assert_eq!(refresh_token, "rt-new"),
            other => panic!("意外的凭证类型: {other:?}"),
        }
    }
}
