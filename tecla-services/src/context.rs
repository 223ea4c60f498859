//! リモートコンテキストとキャッシュ
//!
//! ブレークポイント・レジスタ・シンボルはすべて ID で識別されるコンテキストとして
//! 扱います。デコード済みのコンテキストは [`ContextCache`] に保持し、イベントや
//! 実行状態・メモリマップの変化で無効化します。無効化されたエントリは再取得が必要で、
//! その場で書き換えることはありません。

use crate::error::CacheInconsistency;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tecla_protocol::{DecodeError, PropertyBag, Value};
use tracing::{debug, warn};

/// コンテキストID（サービス内でのみ一意）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(String);

impl ContextId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContextId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ContextId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&ContextId> for Value {
    fn from(id: &ContextId) -> Self {
        Value::Str(id.0.clone())
    }
}

impl From<ContextId> for Value {
    fn from(id: ContextId) -> Self {
        Value::Str(id.0)
    }
}

impl PartialEq<&str> for ContextId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// ID リストを引数用の値に変換する
pub(crate) fn id_list(ids: &[ContextId]) -> Value {
    Value::list(ids.iter())
}

/// プロパティから任意のコンテキストIDを取得する
pub(crate) fn opt_id(bag: &PropertyBag, key: &str) -> Result<Option<ContextId>, DecodeError> {
    Ok(bag.get_str(key)?.map(ContextId::from))
}

/// キャッシュ無効化のきっかけとなる外部イベントの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdatePolicy {
    /// メモリマップが変わったら無効化する
    OnMemoryMapChange,
    /// 実行状態が変わったら無効化する
    OnExecutionStateChange,
}

impl UpdatePolicy {
    pub fn from_code(code: i128) -> Result<Self, DecodeError> {
        match code {
            0 => Ok(Self::OnMemoryMapChange),
            1 => Ok(Self::OnExecutionStateChange),
            value => Err(DecodeError::UnknownEnumValue {
                what: "update policy",
                value,
            }),
        }
    }

    pub fn code(self) -> i128 {
        match self {
            Self::OnMemoryMapChange => 0,
            Self::OnExecutionStateChange => 1,
        }
    }
}

/// ターゲット側の状態変化
///
/// 所有者が `None` の場合は全コンテキストが対象です。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    /// スレッドやプロセスの実行状態が変わった（停止・再開など）
    ExecutionState(Option<ContextId>),
    /// メモリ空間のマップが変わった（モジュールのロードなど）
    MemoryMap(Option<ContextId>),
}

impl StateChange {
    /// この変化で無効化される更新ポリシー
    pub fn policy(&self) -> UpdatePolicy {
        match self {
            Self::ExecutionState(_) => UpdatePolicy::OnExecutionStateChange,
            Self::MemoryMap(_) => UpdatePolicy::OnMemoryMapChange,
        }
    }

    pub fn owner(&self) -> Option<&ContextId> {
        match self {
            Self::ExecutionState(owner) | Self::MemoryMap(owner) => owner.as_ref(),
        }
    }
}

/// デコード済みのコンテキスト
pub trait Context: Clone + Send + 'static {
    fn id(&self) -> &ContextId;

    fn parent_id(&self) -> Option<&ContextId> {
        None
    }

    /// 所有者（スレッド・プロセス・メモリ空間）
    fn owner_id(&self) -> Option<&ContextId> {
        None
    }

    /// 受信したままのプロパティ
    fn properties(&self) -> &PropertyBag;

    fn update_policy(&self) -> UpdatePolicy;
}

/// コンテキストキャッシュ
///
/// ID をキーとするだけで、親子関係の形（木かどうか）は仮定しません。
pub struct ContextCache<C> {
    entries: Mutex<HashMap<ContextId, C>>,
}

impl<C> Default for ContextCache<C> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<C: Context> ContextCache<C> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ContextId, C>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// デコードしたコンテキストを登録する（同じ ID のエントリは置き換える）
    pub fn insert(&self, context: C) -> Option<C> {
        let id = context.id().clone();
        self.lock().insert(id, context)
    }

    pub fn get(&self, id: &ContextId) -> Option<C> {
        self.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &ContextId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// エントリを削除する
    pub fn invalidate(&self, id: &ContextId) -> bool {
        let removed = self.lock().remove(id).is_some();
        if removed {
            debug!("invalidated cached context {}", id);
        }
        removed
    }

    pub fn invalidate_many(&self, ids: &[ContextId]) -> usize {
        let mut entries = self.lock();
        ids.iter().filter(|id| entries.remove(*id).is_some()).count()
    }

    pub fn invalidate_all(&self) -> usize {
        let mut entries = self.lock();
        let count = entries.len();
        entries.clear();
        count
    }

    /// 状態変化に応じてエントリを無効化する
    ///
    /// 更新ポリシーが一致し、所有者も一致する（または変化側の所有者が `None`）
    /// エントリを削除します。削除した数を返します。
    pub fn on_state_change(&self, change: &StateChange) -> usize {
        let policy = change.policy();
        let owner = change.owner();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, ctx| {
            let matches = ctx.update_policy() == policy
                && owner.map_or(true, |o| ctx.owner_id() == Some(o));
            !matches
        });
        let removed = before - entries.len();
        if removed > 0 {
            debug!("{:?}: {} cached contexts invalidated", change, removed);
        }
        removed
    }

    /// 指定した状態変化を理由にエントリを無効化する
    ///
    /// エントリは常に削除します。エントリの更新ポリシーがきっかけと一致しない場合は
    /// 不整合として記録し、その内容を返します。
    pub fn invalidate_for(&self, id: &ContextId, trigger: &StateChange) -> Option<CacheInconsistency> {
        let removed = self.lock().remove(id)?;
        let policy = removed.update_policy();
        if policy == trigger.policy() {
            return None;
        }
        let inconsistency = CacheInconsistency {
            id: id.clone(),
            policy,
            trigger: trigger.policy(),
        };
        warn!("{}", inconsistency);
        Some(inconsistency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Fake {
        id: ContextId,
        owner: Option<ContextId>,
        policy: UpdatePolicy,
        props: PropertyBag,
    }

    impl Fake {
        fn new(id: &str, owner: Option<&str>, policy: UpdatePolicy) -> Self {
            Self {
                id: id.into(),
                owner: owner.map(ContextId::from),
                policy,
                props: PropertyBag::new(),
            }
        }
    }

    impl Context for Fake {
        fn id(&self) -> &ContextId {
            &self.id
        }

        fn owner_id(&self) -> Option<&ContextId> {
            self.owner.as_ref()
        }

        fn properties(&self) -> &PropertyBag {
            &self.props
        }

        fn update_policy(&self) -> UpdatePolicy {
            self.policy
        }
    }

    fn filled() -> ContextCache<Fake> {
        let cache = ContextCache::new();
        cache.insert(Fake::new("a", Some("P1"), UpdatePolicy::OnExecutionStateChange));
        cache.insert(Fake::new("b", Some("P2"), UpdatePolicy::OnExecutionStateChange));
        cache.insert(Fake::new("c", Some("P1"), UpdatePolicy::OnMemoryMapChange));
        cache
    }

    #[test]
    fn test_state_change_matches_policy_and_owner() {
        let cache = filled();
        assert_eq!(cache.on_state_change(&StateChange::ExecutionState(Some("P1".into()))), 1);
        assert!(!cache.contains(&"a".into()));
        assert!(cache.contains(&"b".into()));
        assert!(cache.contains(&"c".into()));

        assert_eq!(cache.on_state_change(&StateChange::MemoryMap(None)), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidate_for_reports_policy_mismatch() {
        let cache = filled();
        assert_eq!(cache.invalidate_for(&"a".into(), &StateChange::ExecutionState(None)), None);

        let inconsistency = cache
            .invalidate_for(&"c".into(), &StateChange::ExecutionState(None))
            .unwrap();
        assert_eq!(inconsistency.policy, UpdatePolicy::OnMemoryMapChange);
        assert!(!cache.contains(&"c".into()));

        assert_eq!(cache.invalidate_for(&"missing".into(), &StateChange::MemoryMap(None)), None);
    }

    #[test]
    fn test_update_policy_codes() {
        assert_eq!(UpdatePolicy::from_code(0), Ok(UpdatePolicy::OnMemoryMapChange));
        assert_eq!(UpdatePolicy::from_code(1), Ok(UpdatePolicy::OnExecutionStateChange));
        assert!(UpdatePolicy::from_code(2).is_err());
    }
}
