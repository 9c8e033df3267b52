use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::{
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
use crate::logging::{self, LogLevel};
use crate::upstream;
use crate::upstream::types::{MessagesRequest, StreamError, StreamEvent};

use super::GatewayState;

/// POST /v1/messages：请求已经是中立形状，校验后直接进编排。
pub async fn handle_messages(
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

    let req = match sonic_rs::from_slice::<MessagesRequest>(&body) {
        Ok(r) => r,
        Err(e) => {
            return claude_error(&AppError::invalid_argument(format!(
                "请求 JSON 解析失败: {e}"
            )));
        }
    };
    if let Err(e) = validate(&req) {
        return claude_error(&e);
    }

    if req.stream.unwrap_or(false) {
        return stream_response(state, req, log);
    }

    match state.dispatcher.send(req).await {
        Ok(resp) => {
            let bytes = sonic_rs::to_vec(&resp).unwrap_or_default();
            if log.client_enabled() {
                logging::client_response(200, start.elapsed(), &bytes);
            }
            ([(header::CONTENT_TYPE, "application/json")], bytes).into_response()
        }
        Err(e) => {
            tracing::warn!("非流式请求失败: {e}");
            claude_error(&e)
        }
    }
}

/// POST /v1/messages/count_tokens：上游没有对应能力，明确拒绝而不是瞎估。
pub async fn handle_count_tokens() -> Response {
    claude_error(&AppError::NotImplemented(
        "count_tokens 暂不支持".to_string(),
    ))
}

fn validate(req: &MessagesRequest) -> Result<(), AppError> {
    if req.model.trim().is_empty() {
        return Err(AppError::invalid_argument("缺少 model 字段"));
    }
    if req.max_tokens == 0 {
        return Err(AppError::invalid_argument("max_tokens 必须大于 0"));
    }
    if req.messages.is_empty() {
        return Err(AppError::invalid_argument("messages 不能为空"));
    }
    Ok(())
}

/// 事件原样透传：event 名与 data 里的 type 一致。
/// 握手失败与中途断流都补发 error + message_stop，客户端不会挂死。
fn stream_response(state: Arc<GatewayState>, req: MessagesRequest, log: LogLevel) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(256);
    let dispatcher = state.dispatcher.clone();

    tokio::spawn(async move {
        match dispatcher.send_stream(req).await {
            Err(e) => {
                tracing::warn!("流式请求握手失败: {e}");
                send_termination(&tx, &e.to_string()).await;
            }
            Ok(resp) => {
                let pump = upstream::stream::read_events(
                    resp,
                    log.stream_events_enabled(),
                    |ev| {
                        let frame = forward_event(&ev);
                        let tx = tx.clone();
                        async move {
                            if let Some(frame) = frame
                                && tx.send(Ok(frame)).await.is_err()
                            {
                                anyhow::bail!("客户端已断开");
                            }
                            Ok(())
                        }
                    },
                );

                match super::race_disconnect(&tx, pump).await {
                    None => tracing::debug!("客户端已断开，终止上游流"),
                    Some(Ok(())) => {}
                    Some(Err(e)) => {
                        tracing::warn!("上游流异常终止: {e}");
                        send_termination(&tx, &e.to_string()).await;
                    }
                }
            }
        }
    });

    Sse::new(ReceiverStream::new(rx)).into_response()
}

fn forward_event(ev: &StreamEvent) -> Option<Event> {
    let data = sonic_rs::to_string(ev).ok()?;
    Some(Event::default().event(ev.event_name()).data(data))
}

async fn send_termination(tx: &mpsc::Sender<Result<Event, Infallible>>, message: &str) {
    let error = StreamEvent::Error {
        error: StreamError {
            kind: "api_error".to_string(),
            message: message.to_string(),
        },
    };
    for ev in [error, StreamEvent::MessageStop] {
        let Some(frame) = forward_event(&ev) else {
            return;
        };
        if tx.send(Ok(frame)).await.is_err() {
            return;
        }
    }
}

/// claude 的错误信封与 openai 不同：外层带 type:error。
fn claude_error(e: &AppError) -> Response {
    let kind = match e {
        AppError::InvalidArgument(_) | AppError::NotImplemented(_) => "invalid_request_error",
        AppError::AuthInvalid(_) | AppError::AuthNetwork(_) => "authentication_error",
        AppError::RateLimited(_) => "rate_limit_error",
        _ => "api_error",
    };
    let body = serde_json::json!({
        "type": "error",
        "error": {
            "type": kind,
            "message": e.to_string(),
        }
    });
    (
        e.status(),
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn validation_rejects_incomplete_requests() {
        let mut req = sonic_rs::from_str::<MessagesRequest>(
            r#"{"model":"m","max_tokens":64,"messages":[{"role":"user","content":"hi"}]}"#,
        )
        .unwrap();
        assert!(validate(&req).is_ok());

        req.max_tokens = 0;
        assert!(matches!(
            validate(&req),
            Err(AppError::InvalidArgument(_))
        ));

        req.max_tokens = 64;
        req.messages.clear();
        assert!(matches!(
            validate(&req),
            Err(AppError::InvalidArgument(_))
        ));
    }

    #[test]
    fn error_envelope_uses_claude_shape() {
        let resp = claude_error(&AppError::invalid_argument("坏请求"));
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = claude_error(&AppError::NotImplemented("count_tokens".to_string()));
        assert_eq!(resp.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[test]
    fn forwarded_frames_carry_event_names() {
        let frame = forward_event(&StreamEvent::MessageStop);
        assert!(frame.is_some());
    }
}
