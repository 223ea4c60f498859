//! サービス層のエラー型

use crate::context::{ContextId, UpdatePolicy};

/// コマンド送信前の入力検証エラー
///
/// この場合コマンドは送信されず、トークンも発行されません。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArgumentError {
    #[error("property `{0}` is required")]
    MissingProperty(&'static str),
    #[error("property `{key}` must be {expected}")]
    InvalidProperty {
        key: &'static str,
        expected: &'static str,
    },
    #[error("value for {id} has {actual} bytes, register size is {expected}")]
    SizeMismatch {
        id: ContextId,
        expected: u64,
        actual: usize,
    },
}

/// 無効化のきっかけとエントリの更新ポリシーが一致しない
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("context {id} is cached with policy {policy:?} but was invalidated by {trigger:?}")]
pub struct CacheInconsistency {
    pub id: ContextId,
    pub policy: UpdatePolicy,
    pub trigger: UpdatePolicy,
}
