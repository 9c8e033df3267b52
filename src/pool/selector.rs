use std::collections::HashSet;

use super::ratelimit;
use super::types::Account;

/// 一次选号的结果。Stick 不动指针，Rotate 由调用方把指针推到新下标。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// 指针账号直接可用，保持粘性。
    Stick(usize),
    /// 指针账号在短冷却窗口内：报告所需等待，由上层决定等还是换。
    Wait { index: usize, wait_ms: i64 },
    /// 从指针向后环扫到的第一个可用账号。
    Rotate(usize),
    /// 没有任何账号符合条件。
    Exhausted,
}

/// 调度策略本体：纯函数，严格按数组顺序环扫，不看使用量或延迟。
/// 调用方负责先跑 clear_expired。
pub fn select(
    accounts: &[Account],
    pointer: usize,
    model: &str,
    exclude: &HashSet<String>,
    short_wait_ms: i64,
) -> Selection {
    if accounts.is_empty() {
        return Selection::Exhausted;
    }

    let pointer = pointer % accounts.len();
    let current = &accounts[pointer];

    if !exclude.contains(&current.email) {
        if ratelimit::is_available(current, model) {
            return Selection::Stick(pointer);
        }
        if !current.is_invalid {
            let wait = ratelimit::wait_ms(current, model);
            if wait > 0 && wait <= short_wait_ms {
                return Selection::Wait {
                    index: pointer,
                    wait_ms: wait,
                };
            }
        }
    }

    for step in 1..accounts.len() {
        let idx = (pointer + step) % accounts.len();
        let candidate = &accounts[idx];
        if exclude.contains(&candidate.email) {
            continue;
        }
        if ratelimit::is_available(candidate, model) {
            return Selection::Rotate(idx);
        }
    }

    Selection::Exhausted
}
