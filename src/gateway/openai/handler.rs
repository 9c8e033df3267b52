use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json,
    body::Bytes,
    extract::{OriginalUri, State},
    http::{HeaderMap, header},
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::AppError;
use crate::gateway::GatewayState;
use crate::logging::{self, LogLevel};
use crate::pool::store::SelectOutcome;
use crate::upstream;
use crate::upstream::types::MessagesRequest;

use super::convert;
use super::stream::{ChatStreamWriter, sse_error_events};
use super::types::ChatRequest;

/// POST /v1/chat/completions
pub async fn handle_chat_completions(
    State(state): State<Arc<GatewayState>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let log = state.cfg.log_level();
    if log.client_enabled() {
        logging::client_request("POST", uri.path(), &headers, &body);
    }
    let start = Instant::now();

    let req = match sonic_rs::from_slice::<ChatRequest>(&body) {
        Ok(r) => r,
        Err(e) => {
            return AppError::invalid_argument(format!("请求 JSON 解析失败: {e}")).into_response();
        }
    };
    let model = req.model.clone();

    let mut neutral = match convert::to_messages_request(&req) {
        Ok(n) => n,
        Err(e) => return e.into_response(),
    };

    if req.stream {
        neutral.stream = Some(true);
        return stream_response(state, model, neutral, log);
    }

    match state.dispatcher.send(neutral).await {
        Ok(resp) => {
            let completion = convert::to_chat_completion(&resp, &model);
            let bytes = sonic_rs::to_vec(&completion).unwrap_or_default();
            if log.client_enabled() {
                logging::client_response(200, start.elapsed(), &bytes);
            }
            (
                [(header::CONTENT_TYPE, "application/json")],
                bytes,
            )
                .into_response()
        }
        Err(e) => {
            tracing::warn!("非流式请求失败: {e}");
            e.into_response()
        }
    }
}

/// 流式响应：握手失败直接发错误事件收尾；握手成功后的中断不再换号，
/// 由 writer 补发终止事件，保证客户端总能看到 [DONE]。
fn stream_response(
    state: Arc<GatewayState>,
    model: String,
    neutral: MessagesRequest,
    log: LogLevel,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(256);
    let dispatcher = state.dispatcher.clone();

    tokio::spawn(async move {
        match dispatcher.send_stream(neutral).await {
            Err(e) => {
                tracing::warn!("流式请求握手失败: {e}");
                send_all(&tx, sse_error_events(&e.to_string())).await;
            }
            Ok(resp) => {
                let mut writer = ChatStreamWriter::new(&model);
                let pump = upstream::stream::read_events(
                    resp,
                    log.stream_events_enabled(),
                    |ev| {
                        let chunks = writer.on_event(&ev);
                        let tx = tx.clone();
                        async move {
                            for chunk in chunks {
                                if tx.send(Ok(Event::default().data(chunk))).await.is_err() {
                                    anyhow::bail!("客户端已断开");
                                }
                            }
                            Ok(())
                        }
                    },
                );

                let outcome = crate::gateway::race_disconnect(&tx, pump).await;
                match outcome {
                    None => tracing::debug!("客户端已断开，终止上游流"),
                    Some(Ok(())) => send_all(&tx, writer.finish_if_needed()).await,
                    Some(Err(e)) => {
                        tracing::warn!("上游流异常终止: {e}");
                        if !writer.is_done() {
                            send_all(&tx, sse_error_events(&e.to_string())).await;
                        }
                    }
                }
            }
        }
    });

    Sse::new(ReceiverStream::new(rx)).into_response()
}

async fn send_all(tx: &mpsc::Sender<Result<Event, Infallible>>, chunks: Vec<String>) {
    for chunk in chunks {
        if tx.send(Ok(Event::default().data(chunk))).await.is_err() {
            return;
        }
    }
}

/// GET /v1/models：挑一个可用账号向上游查可用模型清单。
pub async fn handle_list_models(State(state): State<Arc<GatewayState>>) -> Response {
    let d = &state.dispatcher;
    let account = match d.pool().select_for_model("", &HashSet::new()).await {
        SelectOutcome::Selected(account) => account,
        _ => return AppError::unavailable("没有可用账号").into_response(),
    };
    let token = match d.tokens().resolve(&account).await {
        Ok(t) => t,
        Err(e) => return e.into_response(),
    };
    let project = d.projects().resolve(&account, &token).await;
    match d.upstream().fetch_models(&project, &token).await {
        Ok(models) => Json(convert::to_models_response(&models)).into_response(),
        Err(e) => AppError::unavailable(format!("获取模型列表失败: {e}")).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, PoolConfig};
    use crate::credential::oauth::OauthClient;
    use crate::credential::project::ProjectResolver;
    use crate::credential::token::TokenProvider;
    use crate::dispatch::Dispatcher;
    use crate::pool::store::AccountPool;
    use crate::pool::types::PoolSettings;
    use crate::upstream::client::UpstreamClient;
    use axum::http::{StatusCode, Uri};
    use std::collections::HashMap;

    fn state() -> Arc<GatewayState> {
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
                accounts: vec![],
                settings: PoolSettings {
                    cooldown_seconds: 60,
                    short_wait_seconds: 120,
                    token_ttl_seconds: 3300,
                    initial_index: 0,
                },
            },
        };
        let pool = Arc::new(AccountPool::new(cfg.pool.clone()));
        let oauth = Arc::new(OauthClient::new(&cfg).unwrap());
        let tokens = Arc::new(TokenProvider::new(oauth.clone(), pool.clone()));
        let projects = Arc::new(ProjectResolver::new(oauth));
        let upstream = Arc::new(UpstreamClient::new(&cfg).unwrap());
        let dispatcher = Arc::new(Dispatcher::new(
            pool,
            tokens,
            projects,
            upstream,
            false,
            HashMap::new(),
        ));
        Arc::new(GatewayState { cfg, dispatcher })
    }

    #[tokio::test]
    async fn malformed_json_is_a_client_error() {
        let resp = handle_chat_completions(
            State(state()),
            OriginalUri(Uri::from_static("/v1/chat/completions")),
            HeaderMap::new(),
            Bytes::from_static(b"{not json"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_messages_is_rejected_before_dispatch() {
        let resp = handle_chat_completions(
            State(state()),
            OriginalUri(Uri::from_static("/v1/chat/completions")),
            HeaderMap::new(),
            Bytes::from_static(br#"{"model":"m","messages":[]}"#),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
