use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 账号级别的模型限额表里，空字符串 key 表示整账号限额。
pub const ACCOUNT_WIDE_KEY: &str = "";

/// 配置边界上的账号描述：封闭 tagged union，
/// 未知 source 在反序列化时直接报错，而不是运行期兜底。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase", deny_unknown_fields)]
pub enum AccountConfig {
    Oauth {
        email: String,
        refresh_token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
    },
    Manual {
        email: String,
        api_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
    },
}

impl AccountConfig {
    pub fn email(&self) -> &str {
        match self {
            AccountConfig::Oauth { email, .. } => email,
            AccountConfig::Manual { email, .. } => email,
        }
    }
}

/// 运行期凭证：oauth 持 refresh token（access token 走缓存），manual 持静态 key。
#[derive(Debug, Clone)]
pub enum Credential {
    Oauth { refresh_token: String },
    Manual { api_key: String },
}

/// 账号运行期记录。进程生命周期内账号集合固定，只有
/// last_used / model_rate_limits / is_invalid 会被调度流程改写。
#[derive(Debug, Clone)]
pub struct Account {
    pub email: String,
    pub credential: Credential,
    pub project_id: Option<String>,
    pub added_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub model_rate_limits: HashMap<String, RateLimit>,
    pub is_invalid: bool,
    pub invalid_reason: Option<String>,
}

impl Account {
    pub fn from_config(cfg: AccountConfig) -> Self {
        let (email, credential, project_id) = match cfg {
            AccountConfig::Oauth {
                email,
                refresh_token,
                project_id,
            } => (email, Credential::Oauth { refresh_token }, project_id),
            AccountConfig::Manual {
                email,
                api_key,
                project_id,
            } => (email, Credential::Manual { api_key }, project_id),
        };
        Self {
            email,
            credential,
            project_id,
            added_at: Utc::now(),
            last_used: None,
            model_rate_limits: HashMap::new(),
            is_invalid: false,
            invalid_reason: None,
        }
    }
}

/// 单个账号 + 模型维度的限流记录。
/// is_rate_limited 只在 reset_time 未过期时有意义，过期条目由 clear_expired 扫掉。
#[derive(Debug, Clone, Default)]
pub struct RateLimit {
    pub is_rate_limited: bool,
    pub reset_time: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

/// 调度策略参数，全部来自配置。
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub cooldown_seconds: u64,
    pub short_wait_seconds: u64,
    pub token_ttl_seconds: u64,
    pub initial_index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oauth_config_becomes_oauth_credential() {
        let account = Account::from_config(AccountConfig::Oauth {
            email: "a@x.com".to_string(),
            refresh_token: "rt".to_string(),
            project_id: Some("p".to_string()),
        });
        assert_eq!(account.email, "a@x.com");
        assert!(matches!(account.credential, Credential::Oauth { .. }));
        assert!(!account.is_invalid);
        assert!(account.model_rate_limits.is_empty());
    }

    #[test]
    fn config_with_extra_fields_is_rejected() {
        let text = r#"{"source":"manual","email":"a@x.com","api_key":"k","refresh_token":"rt"}"#;
        assert!(sonic_rs::from_str::<AccountConfig>(text).is_err());
    }
}
