use tokio_stream::StreamExt;

use crate::logging;

use super::types::StreamEvent;

/// 消费上游 SSE 字节流，把每条 data 行解析成 StreamEvent 交给回调。
/// 回调返回 Err（通常是下游通道已关闭）时立即停止读取，
/// 以便尽快释放上游连接；传输中断作为错误上抛，由调用方补发终止事件。
pub async fn read_events<F, Fut>(
    resp: reqwest::Response,
    log_raw: bool,
    mut on_event: F,
) -> anyhow::Result<()>
where
    F: FnMut(StreamEvent) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>>,
{
    let mut buf: Vec<u8> = Vec::with_capacity(4 * 1024);
    let mut processed: usize = 0;

    let mut stream = resp.bytes_stream();
    while let Some(item) = stream.next().await {
        let chunk = item.map_err(|e| anyhow::anyhow!("上游流中断: {e}"))?;
        buf.extend_from_slice(chunk.as_ref());

        while let Some(nl_rel) = buf[processed..].iter().position(|&b| b == b'\n') {
            let nl = processed + nl_rel;
            let line_raw = &buf[processed..nl];
            if log_raw {
                logging::backend_stream_line(line_raw);
            }

            let mut line = line_raw;
            if line.ends_with(b"\r") {
                line = &line[..line.len() - 1];
            }
            processed = nl + 1;

            let Some(event) = parse_data_line(line) else {
                continue;
            };
            let done = matches!(event, StreamEvent::MessageStop);
            on_event(event).await?;
            if done {
                return Ok(());
            }
        }

        // 释放已处理的前缀，避免 buffer 无限增长。
        if processed > 0 {
            buf.drain(..processed);
            processed = 0;
        }
    }

    Ok(())
}

/// "data: {...}" 之外的行（event 名、注释、空行）一律跳过；
/// 解析失败的 data 行同样跳过，坏事件不值得中断整条流。
pub fn parse_data_line(line: &[u8]) -> Option<StreamEvent> {
    let json_bytes = line.strip_prefix(b"data: ")?;
    if json_bytes == b"[DONE]" {
        return None;
    }
    sonic_rs::from_slice::<StreamEvent>(json_bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::types::BlockDelta;

    #[test]
    fn data_lines_parse_into_events() {
        let event = parse_data_line(
            br#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#,
        )
        .unwrap();
        match event {
            StreamEvent::ContentBlockDelta { index: 0, delta } => {
                assert!(matches!(delta, BlockDelta::TextDelta { .. }));
            }
            other => panic!("意外的事件: {other:?}"),
        }
    }

    #[test]
    fn non_data_lines_are_skipped() {
        assert!(parse_data_line(b"event: content_block_delta").is_none());
        assert!(parse_data_line(b"").is_none());
        assert!(parse_data_line(b": keepalive").is_none());
        assert!(parse_data_line(b"data: [DONE]").is_none());
        assert!(parse_data_line(b"data: {\"type\":\"wormhole\"}").is_none());
    }
}
