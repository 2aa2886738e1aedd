//! 对话层：消息类型与近期历史摘录（对话存储本身由调用方负责）

pub mod conversation;

pub use conversation::{history_brief, last_user_content, truncate_chars, Message, Role};
