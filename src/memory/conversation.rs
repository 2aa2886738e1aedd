//! 对话消息与历史摘录
//!
//! 编排层只读取调用方传入的近期对话（存储由外部负责），用于 Planner 上下文与无 hint 步骤的整段转发。

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 按字符截断（不会切断 UTF-8 字符）
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// 最后一条 user 消息内容；没有时返回空串
pub fn last_user_content(messages: &[Message]) -> &str {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or("")
}

/// 近期对话摘录：取最后 `turns` 条，每条压成一行并截到 200 字符，整体不超过 `max_chars`
pub fn history_brief(messages: &[Message], turns: usize, max_chars: usize) -> String {
    let start = messages.len().saturating_sub(turns);
    let lines: Vec<String> = messages[start..]
        .iter()
        .map(|m| {
            let content = m.content.trim().replace('\n', " ");
            format!("{}: {}", m.role.as_str(), truncate_chars(&content, 200))
        })
        .collect();
    truncate_chars(&lines.join("\n"), max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_brief_keeps_tail() {
        let msgs = vec![
            Message::user("第一条"),
            Message::assistant("第二条\n换行"),
            Message::user("第三条"),
        ];
        let brief = history_brief(&msgs, 2, 800);
        assert_eq!(brief, "assistant: 第二条 换行\nuser: 第三条");
    }

    #[test]
    fn test_history_brief_respects_char_budget() {
        let msgs = vec![Message::user("字".repeat(500))];
        let brief = history_brief(&msgs, 6, 50);
        assert_eq!(brief.chars().count(), 50);
    }

    #[test]
    fn test_last_user_content() {
        let msgs = vec![
            Message::user("a"),
            Message::assistant("b"),
            Message::system("c"),
        ];
        assert_eq!(last_user_content(&msgs), "a");
        assert_eq!(last_user_content(&[]), "");
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Message::user("hi")).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"hi"}"#);
    }
}
