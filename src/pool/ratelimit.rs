use chrono::{DateTime, Duration, Utc};

use super::types::{ACCOUNT_WIDE_KEY, Account, RateLimit};

/// 标记限流：model 为 None 时落在整账号条目上。
pub fn mark_rate_limited(
    account: &mut Account,
    reset_delay: Duration,
    model: Option<&str>,
    reason: Option<String>,
) {
    let key = model.unwrap_or(ACCOUNT_WIDE_KEY).to_string();
    account.model_rate_limits.insert(
        key,
        RateLimit {
            is_rate_limited: true,
            reset_time: Some(Utc::now() + reset_delay),
            reason,
        },
    );
}

pub fn mark_invalid(account: &mut Account, reason: impl Into<String>) {
    account.is_invalid = true;
    account.invalid_reason = Some(reason.into());
}

/// 凭证解析成功后把账号放回轮换。
pub fn clear_invalid(account: &mut Account) {
    account.is_invalid = false;
    account.invalid_reason = None;
}

/// 把 reset_time 已过期的限流条目翻回可用。每次选号前跑一遍。
pub fn clear_expired(accounts: &mut [Account]) {
    let now = Utc::now();
    for account in accounts.iter_mut() {
        for limit in account.model_rate_limits.values_mut() {
            if !limit.is_rate_limited {
                continue;
            }
            match limit.reset_time {
                Some(reset) if reset > now => {}
                _ => {
                    limit.is_rate_limited = false;
                    limit.reset_time = None;
                    limit.reason = None;
                }
            }
        }
    }
}

pub fn reset_all(accounts: &mut [Account]) {
    for account in accounts.iter_mut() {
        account.model_rate_limits.clear();
    }
}

fn active_limit<'a>(account: &'a Account, key: &str, now: DateTime<Utc>) -> Option<&'a RateLimit> {
    let limit = account.model_rate_limits.get(key)?;
    if limit.is_rate_limited && limit.reset_time.map(|t| t > now).unwrap_or(false) {
        Some(limit)
    } else {
        None
    }
}

/// 账号对该模型是否可用：未失效，且模型条目与整账号条目都没有在冷却。
pub fn is_available(account: &Account, model: &str) -> bool {
    if account.is_invalid {
        return false;
    }
    let now = Utc::now();
    active_limit(account, model, now).is_none()
        && active_limit(account, ACCOUNT_WIDE_KEY, now).is_none()
}

/// 所有未失效账号都在冷却（且未失效集合非空）才算整体限流。
pub fn is_all_rate_limited(accounts: &[Account], model: &str) -> bool {
    let mut saw_valid = false;
    for account in accounts {
        if account.is_invalid {
            continue;
        }
        saw_valid = true;
        if is_available(account, model) {
            return false;
        }
    }
    saw_valid
}

/// 指定账号对该模型的剩余等待（毫秒）。可用账号返回 0。
pub fn wait_ms(account: &Account, model: &str) -> i64 {
    if account.is_invalid {
        return 0;
    }
    let now = Utc::now();
    let mut max_wait = 0i64;
    for key in [model, ACCOUNT_WIDE_KEY] {
        if let Some(limit) = active_limit(account, key, now)
            && let Some(reset) = limit.reset_time
        {
            max_wait = max_wait.max((reset - now).num_milliseconds());
        }
    }
    max_wait.max(0)
}

/// 活跃限流中最短的剩余等待，没有活跃限流则为 0。
pub fn min_wait_ms(accounts: &[Account], model: &str) -> i64 {
    let mut min: Option<i64> = None;
    for account in accounts {
        if account.is_invalid {
            continue;
        }
        let w = wait_ms(account, model);
        if w > 0 {
            min = Some(min.map_or(w, |m| m.min(w)));
        }
    }
    min.unwrap_or(0)
}
