mod config;
mod credential;
mod dispatch;
mod error;
mod gateway;
mod logging;
mod pool;
mod upstream;
mod util;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::credential::oauth::OauthClient;
use crate::credential::project::ProjectResolver;
use crate::credential::token::TokenProvider;
use crate::dispatch::Dispatcher;
use crate::gateway::{GatewayState, claude, health, openai};
use crate::pool::store::AccountPool;
use crate::upstream::client::UpstreamClient;

fn init_tracing(cfg: &Config) {
    // DEBUG=off 完全静默；其余级别把依赖库压到 warn，本项目日志保底 info，
    // 避免环境里预设的 RUST_LOG=warn 把关键日志滤掉。
    let debug = cfg.debug.trim().to_lowercase();
    let filter = if debug.is_empty() || debug == "off" {
        EnvFilter::new("off")
    } else {
        let env = std::env::var("RUST_LOG").unwrap_or_default();
        let env = env.trim();
        if env.is_empty() {
            EnvFilter::new("warn,poolgate=info")
        } else if env.contains("poolgate") {
            EnvFilter::new(env)
        } else {
            EnvFilter::new(format!("{env},poolgate=info"))
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load()?;
    init_tracing(&cfg);

    let pool = Arc::new(AccountPool::new(cfg.pool.clone()));
    let oauth = Arc::new(OauthClient::new(&cfg)?);
    let tokens = Arc::new(TokenProvider::new(oauth.clone(), pool.clone()));
    let projects = Arc::new(ProjectResolver::new(oauth));
    let upstream = Arc::new(UpstreamClient::new(&cfg)?);
    let dispatcher = Arc::new(Dispatcher::new(
        pool.clone(),
        tokens,
        projects,
        upstream,
        cfg.fallback_mode,
        cfg.fallback_models.clone(),
    ));

    let accounts = pool.len().await;
    if accounts == 0 {
        tracing::warn!("账号池为空：请配置 ACCOUNTS_JSON / ACCOUNTS_FILE 或单账号环境变量");
    } else {
        tracing::info!("账号池加载完成，共 {accounts} 个账号");
    }
    if cfg.fallback_mode {
        tracing::info!("降级模式开启，映射 {} 条", cfg.fallback_models.len());
    }

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("监听地址不合法: {e}"))?;

    let state = Arc::new(GatewayState { cfg, dispatcher });
    let app = Router::new()
        .route("/health", get(health::handle_health))
        .route("/account-limits", get(health::handle_account_limits))
        .route("/refresh-token", post(health::handle_refresh_token))
        .route("/v1/models", get(openai::handler::handle_list_models))
        .route("/v1/messages", post(claude::handle_messages))
        .route("/v1/messages/", post(claude::handle_messages))
        .route("/v1/messages/count_tokens", post(claude::handle_count_tokens))
        .route(
            "/v1/chat/completions",
            post(openai::handler::handle_chat_completions),
        )
        .route(
            "/v1/chat/completions/",
            post(openai::handler::handle_chat_completions),
        )
        .with_state(state);

    tracing::info!("服务启动: http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}
