//! プロパティバッグと値の型
//!
//! リモートエンティティの記述はすべて [`PropertyBag`] で受け渡されます。
//! 受信したバッグは不変で、コマンド送信用のバッグは新しく構築します。

use crate::error::DecodeError;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// プロトコル上の値
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// 値なし（JSON の null）
    Null,
    /// 整数（符号付き・符号なし64ビットの両方を表現できる幅）
    Int(i128),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    Bag(PropertyBag),
    List(Vec<Value>),
}

impl Value {
    /// 値の種類名（エラーメッセージ用）
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "integer",
            Value::Bool(_) => "boolean",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Bag(_) => "property bag",
            Value::List(_) => "list",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i128> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// 符号なし64ビットとして取得する（範囲外なら None）
    pub fn as_u64(&self) -> Option<u64> {
        self.as_int().and_then(|n| u64::try_from(n).ok())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_bag(&self) -> Option<&PropertyBag> {
        match self {
            Value::Bag(bag) => Some(bag),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// 任意の要素列からリスト値を作成する
    pub fn list<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int(n) => write!(f, "{}", n),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Str(s) => write!(f, "{}", s),
            Value::Bytes(bytes) => {
                for b in bytes {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
            Value::Bag(bag) => write!(f, "{}", bag),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

macro_rules! impl_from_int {
    ($($ty:ty),+) => {
        $(
            impl From<$ty> for Value {
                fn from(n: $ty) -> Self {
                    Value::Int(n as i128)
                }
            }
        )+
    };
}

impl_from_int!(i8, i16, i32, i64, i128, u8, u16, u32, u64, usize);

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<PropertyBag> for Value {
    fn from(bag: PropertyBag) -> Self {
        Value::Bag(bag)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// 不変のプロパティバッグ
///
/// クローンは内部のマップを共有します。
#[derive(Clone, Default, PartialEq, Eq)]
pub struct PropertyBag(Arc<BTreeMap<String, Value>>);

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> PropertyBagBuilder {
        PropertyBagBuilder::default()
    }

    /// このバッグを元に新しいバッグを組み立てる
    pub fn to_builder(&self) -> PropertyBagBuilder {
        PropertyBagBuilder {
            entries: (*self.0).clone(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// null は「値なし」として扱う
    fn present(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    fn mismatch(key: &str, expected: &'static str, found: &Value) -> DecodeError {
        DecodeError::PropertyType {
            key: key.to_string(),
            expected,
            found: found.kind(),
        }
    }

    pub fn get_str(&self, key: &str) -> Result<Option<&str>, DecodeError> {
        match self.present(key) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s)),
            Some(other) => Err(Self::mismatch(key, "string", other)),
        }
    }

    pub fn get_int(&self, key: &str) -> Result<Option<i128>, DecodeError> {
        match self.present(key) {
            None => Ok(None),
            Some(Value::Int(n)) => Ok(Some(*n)),
            Some(other) => Err(Self::mismatch(key, "integer", other)),
        }
    }

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, DecodeError> {
        self.get_int(key)?
            .map(|n| u64::try_from(n).map_err(|_| DecodeError::OutOfRange(n)))
            .transpose()
    }

    pub fn get_i64(&self, key: &str) -> Result<Option<i64>, DecodeError> {
        self.get_int(key)?
            .map(|n| i64::try_from(n).map_err(|_| DecodeError::OutOfRange(n)))
            .transpose()
    }

    pub fn get_u32(&self, key: &str) -> Result<Option<u32>, DecodeError> {
        self.get_int(key)?
            .map(|n| u32::try_from(n).map_err(|_| DecodeError::OutOfRange(n)))
            .transpose()
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, DecodeError> {
        match self.present(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(other) => Err(Self::mismatch(key, "boolean", other)),
        }
    }

    /// bool プロパティを取得する（なければ false）
    pub fn flag(&self, key: &str) -> Result<bool, DecodeError> {
        Ok(self.get_bool(key)?.unwrap_or(false))
    }

    pub fn get_bytes(&self, key: &str) -> Result<Option<&[u8]>, DecodeError> {
        match self.present(key) {
            None => Ok(None),
            Some(Value::Bytes(b)) => Ok(Some(b)),
            Some(other) => Err(Self::mismatch(key, "bytes", other)),
        }
    }

    pub fn get_bag(&self, key: &str) -> Result<Option<&PropertyBag>, DecodeError> {
        match self.present(key) {
            None => Ok(None),
            Some(Value::Bag(bag)) => Ok(Some(bag)),
            Some(other) => Err(Self::mismatch(key, "property bag", other)),
        }
    }

    pub fn get_list(&self, key: &str) -> Result<Option<&[Value]>, DecodeError> {
        match self.present(key) {
            None => Ok(None),
            Some(Value::List(items)) => Ok(Some(items)),
            Some(other) => Err(Self::mismatch(key, "list", other)),
        }
    }

    /// 文字列リストを取得する
    pub fn get_str_list(&self, key: &str) -> Result<Option<Vec<String>>, DecodeError> {
        let Some(items) = self.get_list(key)? else {
            return Ok(None);
        };
        items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| Self::mismatch(key, "list of strings", item))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    /// 必須の文字列プロパティを取得する
    pub fn require_str(&self, key: &str) -> Result<&str, DecodeError> {
        self.get_str(key)?
            .ok_or_else(|| DecodeError::MissingProperty(key.to_string()))
    }
}

impl fmt::Debug for PropertyBag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_map().entries(self.0.iter()).finish()
    }
}

impl fmt::Display for PropertyBag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", k, v)?;
        }
        write!(f, "}}")
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for PropertyBag {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        PropertyBag(Arc::new(
            iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }
}

/// プロパティバッグのビルダー
#[derive(Debug, Clone, Default)]
pub struct PropertyBagBuilder {
    entries: BTreeMap<String, Value>,
}

impl PropertyBagBuilder {
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// 値が Some の場合のみ追加する
    pub fn with_opt<V: Into<Value>>(self, key: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(v) => self.with(key, v),
            None => self,
        }
    }

    pub fn without(mut self, key: &str) -> Self {
        self.entries.remove(key);
        self
    }

    pub fn build(self) -> PropertyBag {
        PropertyBag(Arc::new(self.entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_getters() {
        let bag = PropertyBag::builder()
            .with("ID", "bp1")
            .with("Enabled", true)
            .with("Line", 42)
            .with("Nothing", Value::Null)
            .build();

        assert_eq!(bag.get_str("ID").unwrap(), Some("bp1"));
        assert_eq!(bag.get_bool("Enabled").unwrap(), Some(true));
        assert_eq!(bag.get_u64("Line").unwrap(), Some(42));
        assert_eq!(bag.get_str("Nothing").unwrap(), None);
        assert_eq!(bag.get_str("Missing").unwrap(), None);
        assert!(!bag.flag("Temporary").unwrap());
    }

    #[test]
    fn test_type_mismatch_is_reported() {
        let bag = PropertyBag::builder().with("Line", "ten").build();
        let err = bag.get_int("Line").unwrap_err();
        assert_eq!(
            err,
            DecodeError::PropertyType {
                key: "Line".to_string(),
                expected: "integer",
                found: "string",
            }
        );
    }

    #[test]
    fn test_negative_number_is_out_of_range_for_u64() {
        let bag = PropertyBag::builder().with("Size", -1).build();
        assert_eq!(bag.get_u64("Size"), Err(DecodeError::OutOfRange(-1)));
        assert_eq!(bag.get_i64("Size"), Ok(Some(-1)));
    }

    #[test]
    fn test_to_builder_leaves_original_untouched() {
        let original = PropertyBag::builder().with("ID", "bp1").build();
        let changed = original.to_builder().with("Enabled", false).build();

        assert_eq!(original.len(), 1);
        assert_eq!(changed.len(), 2);
        assert_eq!(changed.get_str("ID").unwrap(), Some("bp1"));
    }

    #[test]
    fn test_str_list() {
        let bag = PropertyBag::builder()
            .with("ContextIds", Value::list(["P1", "P2"]))
            .build();
        assert_eq!(
            bag.get_str_list("ContextIds").unwrap(),
            Some(vec!["P1".to_string(), "P2".to_string()])
        );

        let bad = PropertyBag::builder()
            .with("ContextIds", Value::list([1, 2]))
            .build();
        assert!(bad.get_str_list("ContextIds").is_err());
    }
}
