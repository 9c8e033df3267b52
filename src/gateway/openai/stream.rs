use std::collections::HashMap;

use crate::upstream::types::{BlockDelta, ContentBlock, StreamEvent};
use crate::util::id;

use super::convert::{self, THINKING_CLOSE, THINKING_OPEN};
use super::types::{ChatCompletion, Choice, Delta, FunctionCall, ToolCall, Usage};

/// 流式错误统一收尾：一条错误 JSON 加终止哨兵，客户端不会挂死在半截流上。
pub fn sse_error_events(message: &str) -> Vec<String> {
    let body = serde_json::json!({
        "error": {
            "message": message,
            "type": "server_error",
        }
    });
    vec![body.to_string(), "[DONE]".to_string()]
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BlockKind {
    Text,
    Thinking,
    Tool,
}

/// 把中立事件流增量改写成 openai 的 chat.completion.chunk 序列。
/// 角色块懒发送，工具调用按出现顺序编号，思考内容用定界符包裹后混入正文。
pub struct ChatStreamWriter {
    id: String,
    created: i64,
    model: String,
    sent_role: bool,
    block_kinds: HashMap<usize, BlockKind>,
    tool_indices: HashMap<usize, i32>,
    next_tool_index: i32,
    saw_tool_call: bool,
    stop_reason: Option<String>,
    usage: Option<Usage>,
    done: bool,
}

impl ChatStreamWriter {
    pub fn new(model: &str) -> Self {
        Self {
            id: id::chat_completion_id(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            sent_role: false,
            block_kinds: HashMap::new(),
            tool_indices: HashMap::new(),
            next_tool_index: 0,
            saw_tool_call: false,
            stop_reason: None,
            usage: None,
            done: false,
        }
    }

    /// 一个上游事件换零到多条待发字符串，终止哨兵只会出现一次。
    pub fn on_event(&mut self, event: &StreamEvent) -> Vec<String> {
        if self.done {
            return Vec::new();
        }
        let mut out = Vec::new();

        match event {
            StreamEvent::MessageStart { .. } | StreamEvent::Ping => {}
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ContentBlock::Thinking { .. } => {
                    self.block_kinds.insert(*index, BlockKind::Thinking);
                    self.push_role(&mut out);
                    out.push(self.content_chunk(THINKING_OPEN));
                }
                ContentBlock::ToolUse { id, name, .. } => {
                    self.block_kinds.insert(*index, BlockKind::Tool);
                    self.saw_tool_call = true;
                    let tool_index = self.next_tool_index;
                    self.next_tool_index += 1;
                    self.tool_indices.insert(*index, tool_index);
                    self.push_role(&mut out);
                    out.push(self.tool_chunk(ToolCall {
                        index: Some(tool_index),
                        id: id.clone(),
                        typ: "function".to_string(),
                        function: FunctionCall {
                            name: name.clone(),
                            arguments: String::new(),
                        },
                    }));
                }
                _ => {
                    self.block_kinds.insert(*index, BlockKind::Text);
                    self.push_role(&mut out);
                }
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => {
                    self.push_role(&mut out);
                    if !text.is_empty() {
                        out.push(self.content_chunk(text));
                    }
                }
                BlockDelta::ThinkingDelta { thinking } => {
                    self.push_role(&mut out);
                    if !thinking.is_empty() {
                        out.push(self.content_chunk(thinking));
                    }
                }
                BlockDelta::InputJsonDelta { partial_json } => {
                    if let Some(&tool_index) = self.tool_indices.get(index)
                        && !partial_json.is_empty()
                    {
                        out.push(self.tool_chunk(ToolCall {
                            index: Some(tool_index),
                            id: String::new(),
                            typ: String::new(),
                            function: FunctionCall {
                                name: String::new(),
                                arguments: partial_json.clone(),
                            },
                        }));
                    }
                }
                // 签名对下游客户端没有对应概念。
                BlockDelta::SignatureDelta { .. } => {}
            },
            StreamEvent::ContentBlockStop { index } => {
                if self.block_kinds.get(index) == Some(&BlockKind::Thinking) {
                    out.push(self.content_chunk(THINKING_CLOSE));
                }
            }
            StreamEvent::MessageDelta { delta, usage } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason.clone();
                }
                if let Some(u) = usage {
                    self.usage = Some(convert::convert_usage(u));
                }
            }
            StreamEvent::MessageStop => {
                out.extend(self.finish_events());
            }
            StreamEvent::Error { error } => {
                tracing::warn!("上游流中途报错: {}", error.message);
                out.extend(sse_error_events(&error.message));
                self.done = true;
            }
        }

        out
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// 上游没发 message_stop 就断了也要正常收尾。
    pub fn finish_if_needed(&mut self) -> Vec<String> {
        if self.done {
            return Vec::new();
        }
        self.finish_events()
    }

    fn finish_events(&mut self) -> Vec<String> {
        self.done = true;
        let finish =
            convert::map_stop_reason(self.stop_reason.as_deref(), self.saw_tool_call);
        let mut chunk = self.base_chunk();
        chunk.choices = vec![Choice {
            index: 0,
            message: None,
            delta: Some(Delta::default()),
            finish_reason: Some(finish),
        }];
        chunk.usage = self.usage.take();
        vec![serialize(&chunk), "[DONE]".to_string()]
    }

    fn push_role(&mut self, out: &mut Vec<String>) {
        if self.sent_role {
            return;
        }
        self.sent_role = true;
        let mut chunk = self.base_chunk();
        chunk.choices = vec![Choice {
            index: 0,
            message: None,
            delta: Some(Delta {
                role: "assistant".to_string(),
                ..Delta::default()
            }),
            finish_reason: None,
        }];
        out.push(serialize(&chunk));
    }

    fn content_chunk(&self, text: &str) -> String {
        let mut chunk = self.base_chunk();
        chunk.choices = vec![Choice {
            index: 0,
            message: None,
            delta: Some(Delta {
                content: text.to_string(),
                ..Delta::default()
            }),
            finish_reason: None,
        }];
        serialize(&chunk)
    }

    fn tool_chunk(&self, call: ToolCall) -> String {
        let mut chunk = self.base_chunk();
        chunk.choices = vec![Choice {
            index: 0,
            message: None,
            delta: Some(Delta {
                tool_calls: vec![call],
                ..Delta::default()
            }),
            finish_reason: None,
        }];
        serialize(&chunk)
    }

    fn base_chunk(&self) -> ChatCompletion {
        ChatCompletion {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: Vec::new(),
            usage: None,
        }
    }
}

fn serialize(chunk: &ChatCompletion) -> String {
    sonic_rs::to_string(chunk).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::types::{MessageDeltaInfo, StreamError, Usage as NeutralUsage};

    fn drive(writer: &mut ChatStreamWriter, events: &[StreamEvent]) -> Vec<String> {
        let mut out = Vec::new();
        for ev in events {
            out.extend(writer.on_event(ev));
        }
        out
    }

    #[test]
    fn thinking_then_text_stream_is_delimited_and_terminated_once() {
        let mut w = ChatStreamWriter::new("m-large");
        let out = drive(
            &mut w,
            &[
                StreamEvent::ContentBlockStart {
                    index: 0,
                    content_block: ContentBlock::Thinking {
                        thinking: String::new(),
                        signature: None,
                    },
                },
                StreamEvent::ContentBlockDelta {
                    index: 0,
                    delta: BlockDelta::ThinkingDelta {
                        thinking: "先想想".to_string(),
                    },
                },
                StreamEvent::ContentBlockStop { index: 0 },
                StreamEvent::ContentBlockStart {
                    index: 1,
                    content_block: ContentBlock::Text {
                        text: String::new(),
                    },
                },
                StreamEvent::ContentBlockDelta {
                    index: 1,
                    delta: BlockDelta::TextDelta {
                        text: "答案".to_string(),
                    },
                },
                StreamEvent::ContentBlockStop { index: 1 },
                StreamEvent::MessageDelta {
                    delta: MessageDeltaInfo {
                        stop_reason: Some("end_turn".to_string()),
                        stop_sequence: None,
                    },
                    usage: Some(NeutralUsage {
                        input_tokens: 3,
                        output_tokens: 7,
                    }),
                },
                StreamEvent::MessageStop,
            ],
        );

        let joined = out.join("\n");
        assert!(joined.contains("<thinking>"));
        assert!(joined.contains("先想想"));
        assert!(joined.contains("</thinking>"));
        assert!(joined.contains("答案"));
        assert_eq!(out.iter().filter(|s| *s == "[DONE]").count(), 1);
        // 终止 chunk 带 finish_reason 与 usage。
        let finish = &out[out.len() - 2];
        assert!(finish.contains(r#""finish_reason":"stop""#));
        assert!(finish.contains(r#""total_tokens":10"#));
        // 第一条必须是角色块。
        assert!(out[0].contains(r#""role":"assistant""#));
    }

    #[test]
    fn tool_calls_keep_their_own_indices() {
        let mut w = ChatStreamWriter::new("m");
        let out = drive(
            &mut w,
            &[
                StreamEvent::ContentBlockStart {
                    index: 0,
                    content_block: ContentBlock::ToolUse {
                        id: "call_a".to_string(),
                        name: "get_weather".to_string(),
                        input: sonic_rs::Object::new().into_value(),
                    },
                },
                StreamEvent::ContentBlockDelta {
                    index: 0,
                    delta: BlockDelta::InputJsonDelta {
                        partial_json: r#"{"city":"#.to_string(),
                    },
                },
                StreamEvent::ContentBlockStart {
                    index: 1,
                    content_block: ContentBlock::ToolUse {
                        id: "call_b".to_string(),
                        name: "get_time".to_string(),
                        input: sonic_rs::Object::new().into_value(),
                    },
                },
                StreamEvent::ContentBlockDelta {
                    index: 1,
                    delta: BlockDelta::InputJsonDelta {
                        partial_json: "{}".to_string(),
                    },
                },
                StreamEvent::MessageStop,
            ],
        );

        let joined = out.join("\n");
        assert!(joined.contains("call_a"));
        assert!(joined.contains("call_b"));
        assert!(joined.contains(r#""index":1"#));
        // 任何工具调用都强制 tool_calls 收尾。
        assert!(out[out.len() - 2].contains(r#""finish_reason":"tool_calls""#));
    }

    #[test]
    fn error_event_terminates_stream_immediately() {
        let mut w = ChatStreamWriter::new("m");
        let out = w.on_event(&StreamEvent::Error {
            error: StreamError {
                kind: "api_error".to_string(),
                message: "上游过载".to_string(),
            },
        });
        assert!(out[0].contains("上游过载"));
        assert_eq!(out.last().map(String::as_str), Some("[DONE]"));
        // 之后的事件全部吞掉。
        assert!(w.on_event(&StreamEvent::MessageStop).is_empty());
        assert!(w.finish_if_needed().is_empty());
    }

    #[test]
    fn eof_without_message_stop_still_finishes() {
        let mut w = ChatStreamWriter::new("m");
        w.on_event(&StreamEvent::ContentBlockDelta {
            index: 0,
            delta: BlockDelta::TextDelta {
                text: "半截".to_string(),
            },
        });
        let tail = w.finish_if_needed();
        assert_eq!(tail.last().map(String::as_str), Some("[DONE]"));
        assert!(w.finish_if_needed().is_empty());
    }
}
