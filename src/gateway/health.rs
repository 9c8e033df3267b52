use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json,
    extract::{OriginalUri, State},
    http::header,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Serialize;

use crate::pool::types::{ACCOUNT_WIDE_KEY, Account, Credential};
use crate::upstream::client::ModelQuota;

use super::GatewayState;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    total: usize,
    available: usize,
    accounts: Vec<AccountStatus>,
}

/// GET /health：逐账号状态 + 实时配额快照。
/// 只读：除了按需解析凭证之外不触碰任何调度状态。
pub async fn handle_health(State(state): State<Arc<GatewayState>>) -> Response {
    let accounts = collect_statuses(&state).await;
    let available = accounts.iter().filter(|a| a.status == "ok").count();
    Json(HealthResponse {
        status: "ok",
        total: accounts.len(),
        available,
        accounts,
    })
    .into_response()
}

#[derive(Debug, Serialize)]
struct AccountStatus {
    email: String,
    source: &'static str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    invalid_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_used: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    rate_limits: Vec<LimitStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quota: Option<HashMap<String, ModelQuota>>,
}

#[derive(Debug, Serialize)]
struct LimitStatus {
    model: String,
    seconds_remaining: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

fn remaining_text(q: &ModelQuota) -> String {
    match q.remaining_fraction {
        Some(f) => format!("{:.0}%", f * 100.0),
        None => "-".to_string(),
    }
}

/// GET /account-limits：逐账号汇总本地限流记录与上游配额。
/// 配额查询尽力而为，单个账号失败不影响其余账号的展示。
pub async fn handle_account_limits(
    State(state): State<Arc<GatewayState>>,
    OriginalUri(uri): OriginalUri,
) -> Response {
    let statuses = collect_statuses(&state).await;

    let as_table = uri
        .query()
        .map(|q| q.split('&').any(|kv| kv == "format=table"))
        .unwrap_or(false);
    if as_table {
        (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            render_table(&statuses),
        )
            .into_response()
    } else {
        Json(statuses).into_response()
    }
}

async fn collect_statuses(state: &GatewayState) -> Vec<AccountStatus> {
    let d = &state.dispatcher;
    let snapshot = d.pool().snapshot().await;
    let now = Utc::now();

    let mut out = Vec::with_capacity(snapshot.len());
    for account in snapshot {
        let rate_limits: Vec<LimitStatus> = account
            .model_rate_limits
            .iter()
            .filter(|(_, l)| l.is_rate_limited)
            .filter_map(|(model, l)| {
                let reset = l.reset_time?;
                let remaining = (reset - now).num_seconds();
                if remaining <= 0 {
                    return None;
                }
                Some(LimitStatus {
                    model: if model == ACCOUNT_WIDE_KEY {
                        "*".to_string()
                    } else {
                        model.clone()
                    },
                    seconds_remaining: remaining,
                    reason: l.reason.clone(),
                })
            })
            .collect();

        let status = if account.is_invalid {
            "invalid"
        } else if !rate_limits.is_empty() {
            "rate_limited"
        } else {
            "ok"
        };

        let quota = if account.is_invalid {
            None
        } else {
            fetch_quota_for(state, &account).await
        };

        out.push(AccountStatus {
            email: account.email.clone(),
            source: match account.credential {
                Credential::Oauth { .. } => "oauth",
                Credential::Manual { .. } => "manual",
            },
            status,
            invalid_reason: account.invalid_reason.clone(),
            last_used: account.last_used.map(|t| t.to_rfc3339()),
            rate_limits,
            quota,
        });
    }
    out
}

async fn fetch_quota_for(
    state: &GatewayState,
    account: &Account,
) -> Option<HashMap<String, ModelQuota>> {
    let d = &state.dispatcher;
    let token = match d.tokens().resolve(account).await {
        Ok(t) => t,
        Err(e) => {
            tracing::debug!("账号 {} 配额查询跳过（凭证不可用）: {e}", account.email);
            return None;
        }
    };
    let project = d.projects().resolve(account, &token).await;
    match d.upstream().fetch_quota(&project, &token).await {
        Ok(q) => Some(q),
        Err(e) => {
            tracing::debug!("账号 {} 配额查询失败: {e}", account.email);
            None
        }
    }
}

fn render_table(statuses: &[AccountStatus]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{:<32} {:<8} {:<12} {:<28} {:<10} {}\n",
        "EMAIL", "SOURCE", "STATUS", "MODEL", "REMAINING", "RESET"
    ));
    out.push_str(&"-".repeat(100));
    out.push('\n');

    for s in statuses {
        let mut rows: Vec<(String, String, String)> = Vec::new();
        if let Some(quota) = &s.quota {
            let mut models: Vec<&String> = quota.keys().collect();
            models.sort();
            for model in models {
                let q = &quota[model];
                rows.push((
                    model.clone(),
                    remaining_text(q),
                    q.reset_time.clone().unwrap_or_else(|| "-".to_string()),
                ));
            }
        }
        for l in &s.rate_limits {
            rows.push((
                l.model.clone(),
                "0%".to_string(),
                format!("{}s", l.seconds_remaining),
            ));
        }
        if rows.is_empty() {
            rows.push(("-".to_string(), "-".to_string(), "-".to_string()));
        }

        for (i, (model, remaining, reset)) in rows.iter().enumerate() {
            let (email, source, status) = if i == 0 {
                (s.email.as_str(), s.source, s.status)
            } else {
                ("", "", "")
            };
            out.push_str(&format!(
                "{email:<32} {source:<8} {status:<12} {model:<28} {remaining:<10} {reset}\n"
            ));
        }
    }
    out
}

#[derive(Debug, Serialize)]
struct RefreshResponse {
    cleared: bool,
    recovered: usize,
    message: String,
}

/// POST /refresh-token：清空 access token / 项目缓存，
/// 逐个重试失效账号（解析成功即回到轮换），再挑一个可用账号预热一次。
/// 全程尽力而为，失败只记日志不报错。
pub async fn handle_refresh_token(State(state): State<Arc<GatewayState>>) -> Response {
    let d = &state.dispatcher;
    d.tokens().invalidate_all();
    d.projects().invalidate_all();

    let snapshot = d.pool().snapshot().await;
    let mut recovered = 0usize;
    for account in snapshot.iter().filter(|a| a.is_invalid) {
        match d.tokens().resolve(account).await {
            Ok(_) => {
                tracing::info!("账号 {} 凭证恢复，回到轮换", account.email);
                recovered += 1;
            }
            Err(e) => tracing::warn!("账号 {} 凭证仍不可用: {e}", account.email),
        }
    }

    let mut warmed = false;
    if let Some(account) = snapshot.iter().find(|a| !a.is_invalid) {
        match d.tokens().resolve(account).await {
            Ok(_) => warmed = true,
            Err(e) => tracing::warn!("刷新后预热账号 {} 失败: {e}", account.email),
        }
    }

    Json(RefreshResponse {
        cleared: true,
        recovered,
        message: if warmed {
            "缓存已清空，凭证刷新成功".to_string()
        } else {
            "缓存已清空".to_string()
        },
    })
    .into_response()
}
