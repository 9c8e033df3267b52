use uuid::Uuid;

pub fn tool_call_id() -> String {
    format!("call_{}", Uuid::new_v4().simple())
}

pub fn chat_completion_id() -> String {
    let s = Uuid::new_v4().to_string();
    let prefix = s.split('-').next().unwrap_or(&s);
    let short = &prefix[..prefix.len().min(8)];
    format!("chatcmpl-{short}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_expected_prefixes() {
        assert!(tool_call_id().starts_with("call_"));
        assert!(chat_completion_id().starts_with("chatcmpl-"));
    }
}
