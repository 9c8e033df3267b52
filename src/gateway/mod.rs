pub mod claude;
pub mod health;
pub mod openai;

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::dispatch::Dispatcher;

/// 所有 HTTP 处理器共用的一份网关状态。
pub struct GatewayState {
    pub cfg: Config,
    pub dispatcher: Arc<Dispatcher>,
}

/// 客户端一断开立即返回 None，不等上游的下一个事件。
/// 上游长时间静默（如深度思考）时也能及时放弃读取、释放连接。
pub(crate) async fn race_disconnect<T, F: Future>(
    tx: &mpsc::Sender<T>,
    fut: F,
) -> Option<F::Output> {
    tokio::select! {
        _ = tx.closed() => None,
        out = fut => Some(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disconnect_wins_over_a_silent_upstream() {
        let (tx, rx) = mpsc::channel::<()>(1);
        drop(rx);
        let out = race_disconnect(&tx, std::future::pending::<()>()).await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn a_live_client_gets_the_read_result() {
        let (tx, _rx) = mpsc::channel::<()>(1);
        let out = race_disconnect(&tx, async { 7 }).await;
        assert_eq!(out, Some(7));
    }
}
