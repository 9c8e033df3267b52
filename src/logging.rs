use axum::http::HeaderMap;
use sonic_rs::prelude::*;
use std::time::Duration;

/// 日志等级：
/// - off：不输出客户端/后端的详细请求响应
/// - low：输出客户端请求/响应（格式化/脱敏）
/// - medium：输出客户端 + 后端请求/响应（格式化/脱敏）
/// - high：同 medium，额外逐条输出后端流式事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "client" => Self::Low,
            "medium" | "backend" => Self::Medium,
            "high" | "all" => Self::High,
            _ => Self::Off,
        }
    }

    pub fn client_enabled(self) -> bool {
        self >= Self::Low
    }

    pub fn backend_enabled(self) -> bool {
        self >= Self::Medium
    }

    pub fn stream_events_enabled(self) -> bool {
        self >= Self::High
    }
}

pub fn format_duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

pub fn client_request(method: &str, path: &str, headers: &HeaderMap, body: &[u8]) {
    tracing::info!(
        "\n===================== 客户端请求 ======================\n[客户端请求] {method} {path}\n[客户端请求头]\n{}\n{}\n=========================================================",
        format_headers(headers, HeaderRedact::Client),
        format_body_bytes(body)
    );
}

pub fn client_response(status: u16, duration: Duration, body: &[u8]) {
    tracing::info!(
        "\n===================== 客户端响应 ======================\n[客户端响应] {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        format_body_bytes(body)
    );
}

pub fn backend_request(method: &str, url: &str, body: &[u8]) {
    tracing::info!(
        "\n====================== 后端请求 ========================\n[后端请求] {method} {url}\n{}\n==========================================================",
        format_body_bytes(body)
    );
}

pub fn backend_response(status: u16, duration: Duration, body: &[u8]) {
    tracing::info!(
        "\n====================== 后端响应 ========================\n[后端响应] {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        format_body_bytes(body)
    );
}

pub fn backend_stream_line(line: &[u8]) {
    tracing::info!("{}", String::from_utf8_lossy(line));
}

enum HeaderRedact {
    Client,
}

fn format_headers(headers: &HeaderMap, kind: HeaderRedact) -> String {
    let mut obj = sonic_rs::Object::new();

    for (name, value) in headers.iter() {
        let key = name.as_str();
        let key_lc = key.to_lowercase();

        let redacted = match kind {
            HeaderRedact::Client => {
                key_lc == "authorization"
                    || key_lc == "proxy-authorization"
                    || key_lc == "x-api-key"
                    || key_lc == "cookie"
            }
        };

        let v = if redacted {
            sonic_rs::Value::from("Bearer ***")
        } else {
            match value.to_str() {
                Ok(s) => sonic_rs::Value::from(s),
                Err(_) => sonic_rs::Value::from("<binary>"),
            }
        };

        // HeaderMap 可能存在同名多值，统一用数组输出，避免信息丢失。
        if let Some(existing) = obj.get(&key).and_then(|v| v.as_array()) {
            let mut arr = existing.to_vec();
            arr.push(v);
            obj.insert(key, arr);
        } else {
            obj.insert(key, vec![v]);
        }
    }

    format_body_value(&obj.into_value())
}

fn format_body_value(v: &sonic_rs::Value) -> String {
    let sanitized = sanitize_json_for_log(v);
    match sonic_rs::to_string_pretty(&sanitized) {
        Ok(s) => s,
        Err(_) => sanitized.to_string(),
    }
}

fn format_body_bytes(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }

    match sonic_rs::from_slice::<sonic_rs::Value>(bytes) {
        Ok(v) => format_body_value(&v),
        Err(_) => truncate_text_for_log(&String::from_utf8_lossy(bytes)),
    }
}

fn truncate_text_for_log(s: &str) -> String {
    const MAX_CHARS: usize = 32 * 1024;
    if s.chars().count() <= MAX_CHARS {
        return s.to_string();
    }
    let mut out = String::with_capacity(MAX_CHARS + 64);
    for (i, ch) in s.chars().enumerate() {
        if i >= MAX_CHARS {
            break;
        }
        out.push(ch);
    }
    out.push_str("...[TRUNCATED]");
    out
}

/// 递归走 Value：把 base64 图片数据折叠成占位片段，避免日志爆量。
fn sanitize_json_for_log(v: &sonic_rs::Value) -> sonic_rs::Value {
    if let Some(obj) = v.as_object() {
        let is_base64_ctx = obj
            .get(&"type")
            .and_then(|t| t.as_str())
            .map(|t| t.trim() == "base64")
            .unwrap_or(false);

        let mut out = sonic_rs::Object::new();
        for (key, child) in obj.iter() {
            let sanitized = if key == "data" && is_base64_ctx {
                match child.as_str() {
                    Some(s) => sonic_rs::Value::from(truncate_base64(s).as_str()),
                    None => sanitize_json_for_log(child),
                }
            } else {
                sanitize_json_for_log(child)
            };
            out.insert(key, sanitized);
        }
        return out.into_value();
    }

    if let Some(arr) = v.as_array() {
        let mut out = Vec::with_capacity(arr.len());
        for item in arr {
            out.push(sanitize_json_for_log(item));
        }
        return sonic_rs::Value::from(out);
    }

    v.to_owned()
}

fn truncate_base64(s: &str) -> String {
    const KEEP: usize = 20;
    if s.len() <= KEEP * 2 + 64 {
        return s.to_string();
    }
    let omitted = s.len() - KEEP * 2;
    format!(
        "{}...[TRUNCATED: {omitted} chars]...{}",
        &s[..KEEP],
        &s[s.len() - KEEP..]
    )
}
