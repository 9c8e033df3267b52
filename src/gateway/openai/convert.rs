use sonic_rs::prelude::*;

use crate::error::AppError;
use crate::upstream::types::{
    ContentBlock, Message, MessageContent, MessagesRequest, MessagesResponse, Role, ToolChoice,
    ToolDef,
};
use crate::util::id;

use super::types::{
    ChatCompletion, ChatMessage, ChatRequest, Choice, FunctionCall, ModelItem, ModelsResponse,
    ToolCall, Usage,
};

/// 思考内容的可见定界符：不支持独立推理通道的客户端也能看到完整输出。
pub const THINKING_OPEN: &str = "<thinking>\n";
pub const THINKING_CLOSE: &str = "\n</thinking>\n\n";

const DEFAULT_MAX_TOKENS: u32 = 8192;

/// openai chat 请求转中立形状。
/// system 消息抽出拼接、tool 消息折回 user + tool_result、
/// assistant 的 tool_calls 展开成 tool_use 块。
pub fn to_messages_request(req: &ChatRequest) -> Result<MessagesRequest, AppError> {
    if req.model.trim().is_empty() {
        return Err(AppError::invalid_argument("缺少 model 字段"));
    }
    if req.messages.is_empty() {
        return Err(AppError::invalid_argument("messages 不能为空"));
    }

    // 不支持的采样参数：只记诊断日志，不拒绝请求。
    if req.frequency_penalty.is_some() || req.presence_penalty.is_some() {
        tracing::debug!("忽略不支持的采样参数 frequency_penalty/presence_penalty");
    }
    if let Some(n) = req.n
        && n > 1
    {
        tracing::debug!("忽略不支持的参数 n={n}，始终只生成一个候选");
    }

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Message> = Vec::new();

    for m in &req.messages {
        match m.role.as_str() {
            "system" | "developer" => {
                let text = flatten_text(&m.content);
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            "tool" => {
                messages.push(Message {
                    role: Role::User,
                    content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                        tool_use_id: m.tool_call_id.clone(),
                        content: m.content.clone(),
                    }]),
                });
            }
            "assistant" => {
                let mut blocks: Vec<ContentBlock> = Vec::new();
                let text = flatten_text(&m.content);
                if !text.is_empty() {
                    blocks.push(ContentBlock::Text { text });
                }
                for tc in &m.tool_calls {
                    let tool_id = if tc.id.is_empty() {
                        id::tool_call_id()
                    } else {
                        tc.id.clone()
                    };
                    blocks.push(ContentBlock::ToolUse {
                        id: tool_id,
                        name: tc.function.name.clone(),
                        input: parse_tool_arguments(&tc.function.arguments),
                    });
                }
                if !blocks.is_empty() {
                    messages.push(Message {
                        role: Role::Assistant,
                        content: MessageContent::Blocks(blocks),
                    });
                }
            }
            _ => {
                messages.push(Message {
                    role: Role::User,
                    content: convert_user_content(&m.content),
                });
            }
        }
    }

    if messages.is_empty() {
        return Err(AppError::invalid_argument(
            "messages 中没有任何 user/assistant 消息",
        ));
    }

    let tools: Vec<ToolDef> = req
        .tools
        .iter()
        .filter(|t| {
            if t.typ == "function" {
                true
            } else {
                tracing::debug!("忽略不支持的工具类型: {}", t.typ);
                false
            }
        })
        .map(|t| ToolDef {
            name: t.function.name.clone(),
            description: if t.function.description.is_empty() {
                None
            } else {
                Some(t.function.description.clone())
            },
            input_schema: t.function.parameters.clone(),
        })
        .collect();

    Ok(MessagesRequest {
        model: req.model.clone(),
        max_tokens: req.max_tokens.filter(|&n| n > 0).unwrap_or(DEFAULT_MAX_TOKENS),
        messages,
        system: if system_parts.is_empty() {
            None
        } else {
            Some(sonic_rs::Value::from(system_parts.join("\n\n").as_str()))
        },
        stream: if req.stream { Some(true) } else { None },
        temperature: req.temperature,
        top_p: req.top_p,
        stop_sequences: convert_stop(req.stop.as_ref()),
        tools,
        tool_choice: req.tool_choice.as_ref().and_then(convert_tool_choice),
        thinking: None,
    })
}

/// 中立响应转 openai chat.completion（非流式）。
/// 块顺序保持原样：thinking 裹定界符与正文拼成一个 content，
/// tool_use 变 tool_calls；出现任何工具调用时 finish_reason 强制为 tool_calls。
pub fn to_chat_completion(resp: &MessagesResponse, model: &str) -> ChatCompletion {
    let mut content = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in &resp.content {
        match block {
            ContentBlock::Thinking { thinking, .. } => {
                content.push_str(THINKING_OPEN);
                content.push_str(thinking);
                content.push_str(THINKING_CLOSE);
            }
            ContentBlock::Text { text } => content.push_str(text),
            ContentBlock::ToolUse { id, name, input } => {
                let idx = tool_calls.len() as i32;
                tool_calls.push(ToolCall {
                    index: Some(idx),
                    id: id.clone(),
                    typ: "function".to_string(),
                    function: FunctionCall {
                        name: name.clone(),
                        arguments: sonic_rs::to_string(input)
                            .unwrap_or_else(|_| "{}".to_string()),
                    },
                });
            }
            // 图片与 tool_result 不会出现在模型输出里。
            ContentBlock::Image { .. } | ContentBlock::ToolResult { .. } => {}
        }
    }

    let finish = map_stop_reason(resp.stop_reason.as_deref(), !tool_calls.is_empty());

    ChatCompletion {
        id: id::chat_completion_id(),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: Some(ChatMessage {
                role: "assistant".to_string(),
                content: sonic_rs::Value::from(content.as_str()),
                tool_calls,
                tool_call_id: String::new(),
                name: String::new(),
            }),
            delta: None,
            finish_reason: Some(finish),
        }],
        usage: Some(convert_usage(&resp.usage)),
    }
}

pub fn map_stop_reason(stop: Option<&str>, has_tool_calls: bool) -> String {
    if has_tool_calls {
        return "tool_calls".to_string();
    }
    match stop {
        Some("max_tokens") => "length".to_string(),
        Some("tool_use") => "tool_calls".to_string(),
        _ => "stop".to_string(),
    }
}

pub fn convert_usage(usage: &crate::upstream::types::Usage) -> Usage {
    Usage {
        prompt_tokens: usage.input_tokens as i64,
        completion_tokens: usage.output_tokens as i64,
        total_tokens: (usage.input_tokens + usage.output_tokens) as i64,
    }
}

pub fn to_models_response(models: &[String]) -> ModelsResponse {
    ModelsResponse {
        object: "list".to_string(),
        data: models
            .iter()
            .map(|m| ModelItem {
                id: m.clone(),
                object: "model".to_string(),
                owned_by: "poolgate".to_string(),
            })
            .collect(),
    }
}

fn flatten_text(content: &sonic_rs::Value) -> String {
    if let Some(s) = content.as_str() {
        return s.to_string();
    }
    if let Some(arr) = content.as_array() {
        let mut out = String::new();
        for part in arr.iter() {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        return out;
    }
    String::new()
}

fn convert_user_content(content: &sonic_rs::Value) -> MessageContent {
    if let Some(s) = content.as_str() {
        return MessageContent::Text(s.to_string());
    }
    if let Some(arr) = content.as_array() {
        let mut blocks: Vec<ContentBlock> = Vec::new();
        for part in arr.iter() {
            match part.get("type").and_then(|t| t.as_str()) {
                Some("image_url") => {
                    if let Some(source) = part.get("image_url") {
                        blocks.push(ContentBlock::Image {
                            source: source.to_owned(),
                        });
                    }
                }
                _ => {
                    if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                        blocks.push(ContentBlock::Text {
                            text: text.to_string(),
                        });
                    }
                }
            }
        }
        if !blocks.is_empty() {
            return MessageContent::Blocks(blocks);
        }
    }
    MessageContent::Text(String::new())
}

/// 坏掉的参数 JSON 不丢弃，包进 raw_arguments 原样带给上游。
fn parse_tool_arguments(raw: &str) -> sonic_rs::Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return sonic_rs::Object::new().into_value();
    }
    match sonic_rs::from_str::<sonic_rs::Value>(trimmed) {
        Ok(v) => v,
        Err(_) => {
            let mut obj = sonic_rs::Object::new();
            obj.insert("raw_arguments", trimmed);
            obj.into_value()
        }
    }
}

fn convert_stop(v: Option<&sonic_rs::Value>) -> Vec<String> {
    let Some(v) = v else {
        return Vec::new();
    };
    if let Some(s) = v.as_str() {
        return vec![s.to_string()];
    }
    if let Some(arr) = v.as_array() {
        return arr
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect();
    }
    Vec::new()
}

fn convert_tool_choice(v: &sonic_rs::Value) -> Option<ToolChoice> {
    if let Some(s) = v.as_str() {
        return match s {
            "none" => Some(ToolChoice::None),
            "auto" => Some(ToolChoice::Auto),
            "required" => Some(ToolChoice::Any),
            _ => None,
        };
    }
    if v.get("type").and_then(|t| t.as_str()) == Some("function")
        && let Some(name) = v
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(|n| n.as_str())
    {
        return Some(ToolChoice::Tool {
            name: name.to_string(),
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::openai::types::{Function, Tool};
    use crate::upstream::types::Usage as NeutralUsage;

    fn chat_request() -> ChatRequest {
        ChatRequest {
            model: "m-large".to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: sonic_rs::Value::from("帮我查天气"),
                tool_calls: Vec::new(),
                tool_call_id: String::new(),
                name: String::new(),
            }],
            stream: false,
            temperature: Some(0.7),
            top_p: None,
            max_tokens: Some(256),
            stop: None,
            tools: vec![Tool {
                typ: "function".to_string(),
                function: Function {
                    name: "get_weather".to_string(),
                    description: "查询指定城市的天气".to_string(),
                    parameters: sonic_rs::from_str(
                        r#"{"type":"object","properties":{"city":{"type":"string"}}}"#,
                    )
                    .unwrap(),
                },
            }],
            tool_choice: None,
            frequency_penalty: None,
            presence_penalty: None,
            n: None,
        }
    }

    #[test]
    fn round_trip_preserves_tool_and_text() {
        let req = chat_request();
        let neutral = to_messages_request(&req).unwrap();

        assert_eq!(neutral.model, "m-large");
        assert_eq!(neutral.tools.len(), 1);
        assert_eq!(neutral.tools[0].name, "get_weather");
        assert_eq!(
            neutral.tools[0].description.as_deref(),
            Some("查询指定城市的天气")
        );
        match &neutral.messages[0].content {
            MessageContent::Text(t) => assert_eq!(t, "帮我查天气"),
            other => panic!("意外的消息内容: {other:?}"),
        }

        let resp = MessagesResponse {
            id: "msg_1".to_string(),
            kind: "message".to_string(),
            role: Role::Assistant,
            model: "m-large".to_string(),
            content: vec![ContentBlock::Text {
                text: "今天晴".to_string(),
            }],
            stop_reason: Some("end_turn".to_string()),
            stop_sequence: None,
            usage: NeutralUsage {
                input_tokens: 10,
                output_tokens: 5,
            },
        };
        let out = to_chat_completion(&resp, "m-large");
        let message = out.choices[0].message.as_ref().unwrap();
        assert_eq!(message.content.as_str(), Some("今天晴"));
        assert_eq!(out.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(out.usage.as_ref().unwrap().total_tokens, 15);
    }

    #[test]
    fn system_messages_concatenate_into_one_field() {
        let mut req = chat_request();
        req.messages.insert(
            0,
            ChatMessage {
                role: "system".to_string(),
                content: sonic_rs::Value::from("规则一"),
                tool_calls: Vec::new(),
                tool_call_id: String::new(),
                name: String::new(),
            },
        );
        req.messages.insert(
            1,
            ChatMessage {
                role: "system".to_string(),
                content: sonic_rs::Value::from("规则二"),
                tool_calls: Vec::new(),
                tool_call_id: String::new(),
                name: String::new(),
            },
        );
        let neutral = to_messages_request(&req).unwrap();
        assert_eq!(
            neutral.system.as_ref().and_then(|s| s.as_str()),
            Some("规则一\n\n规则二")
        );
        assert_eq!(neutral.messages.len(), 1);
    }

    #[test]
    fn tool_role_becomes_user_tool_result() {
        let mut req = chat_request();
        req.messages.push(ChatMessage {
            role: "tool".to_string(),
            content: sonic_rs::Value::from("晴，25 度"),
            tool_calls: Vec::new(),
            tool_call_id: "call_1".to_string(),
            name: String::new(),
        });
        let neutral = to_messages_request(&req).unwrap();
        let last = neutral.messages.last().unwrap();
        assert!(matches!(last.role, Role::User));
        match &last.content {
            MessageContent::Blocks(blocks) => match &blocks[0] {
                ContentBlock::ToolResult { tool_use_id, .. } => {
                    assert_eq!(tool_use_id, "call_1");
                }
                other => panic!("意外的块: {other:?}"),
            },
            other => panic!("意外的内容: {other:?}"),
        }
    }

    #[test]
    fn malformed_tool_arguments_are_preserved_raw() {
        let input = parse_tool_arguments("{broken json");
        assert_eq!(
            input.get("raw_arguments").and_then(|v| v.as_str()),
            Some("{broken json")
        );
        assert!(parse_tool_arguments("").is_object());
    }

    #[test]
    fn tool_choice_vocabulary_maps() {
        assert!(matches!(
            convert_tool_choice(&sonic_rs::Value::from("none")),
            Some(ToolChoice::None)
        ));
        assert!(matches!(
            convert_tool_choice(&sonic_rs::Value::from("auto")),
            Some(ToolChoice::Auto)
        ));
        assert!(matches!(
            convert_tool_choice(&sonic_rs::Value::from("required")),
            Some(ToolChoice::Any)
        ));
        let explicit = sonic_rs::from_str::<sonic_rs::Value>(
            r#"{"type":"function","function":{"name":"get_weather"}}"#,
        )
        .unwrap();
        match convert_tool_choice(&explicit) {
            Some(ToolChoice::Tool { name }) => assert_eq!(name, "get_weather"),
            other => panic!("意外的 tool_choice: {other:?}"),
        }
    }

    #[test]
    fn stop_accepts_string_or_array() {
        assert_eq!(
            convert_stop(Some(&sonic_rs::Value::from("END"))),
            vec!["END".to_string()]
        );
        let arr = sonic_rs::from_str::<sonic_rs::Value>(r#"["a","b"]"#).unwrap();
        assert_eq!(
            convert_stop(Some(&arr)),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(convert_stop(None).is_empty());
    }

    #[test]
    fn thinking_blocks_are_visibly_delimited() {
        let resp = MessagesResponse {
            id: "msg_1".to_string(),
            kind: "message".to_string(),
            role: Role::Assistant,
            model: "m".to_string(),
            content: vec![
                ContentBlock::Thinking {
                    thinking: "先查城市".to_string(),
                    signature: Some("sig".to_string()),
                },
                ContentBlock::Text {
                    text: "好的".to_string(),
                },
            ],
            stop_reason: Some("end_turn".to_string()),
            stop_sequence: None,
            usage: NeutralUsage::default(),
        };
        let out = to_chat_completion(&resp, "m");
        let content = out.choices[0]
            .message
            .as_ref()
            .unwrap()
            .content
            .as_str()
            .unwrap()
            .to_string();
        assert!(content.starts_with(THINKING_OPEN));
        assert!(content.contains("先查城市"));
        assert!(content.contains(THINKING_CLOSE));
        assert!(content.ends_with("好的"));
    }

    #[test]
    fn any_tool_use_forces_tool_calls_finish_reason() {
        let resp = MessagesResponse {
            id: "msg_1".to_string(),
            kind: "message".to_string(),
            role: Role::Assistant,
            model: "m".to_string(),
            content: vec![ContentBlock::ToolUse {
                id: "call_1".to_string(),
                name: "get_weather".to_string(),
                input: sonic_rs::from_str(r#"{"city":"上海"}"#).unwrap(),
            }],
            stop_reason: Some("end_turn".to_string()),
            stop_sequence: None,
            usage: NeutralUsage::default(),
        };
        let out = to_chat_completion(&resp, "m");
        assert_eq!(out.choices[0].finish_reason.as_deref(), Some("tool_calls"));
        let calls = &out.choices[0].message.as_ref().unwrap().tool_calls;
        assert_eq!(calls.len(), 1);
        assert!(calls[0].function.arguments.contains("上海"));
    }
}
