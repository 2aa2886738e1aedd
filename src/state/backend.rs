//! 慢速持久层接口
//!
//! 每个 trace_id 一条记录，内容为完整 RunState。实现必须保证版本更旧的写入不会覆盖更新的记录。

use async_trait::async_trait;

use crate::core::StoreError;
use crate::state::RunState;

#[async_trait]
pub trait StateBackend: Send + Sync {
    /// 按 version 写入；库中已有相同或更新版本时静默跳过
    async fn save(&self, state: &RunState) -> Result<(), StoreError>;

    async fn load(&self, trace_id: &str) -> Result<Option<RunState>, StoreError>;

    /// 全部记录（无序）
    async fn list(&self) -> Result<Vec<RunState>, StoreError>;
}

/// trace_id 只允许字母、数字、`-`、`_`
pub(crate) fn validate_key(trace_id: &str) -> Result<(), StoreError> {
    let ok = !trace_id.is_empty()
        && trace_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(trace_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("0b6e1a2c-1f1d-4c2a-9a55-1c9e2f6f2a10").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("").is_err());
    }
}
