//! JSON ワイヤ形式
//!
//! 値は JSON にマップされます。バイト列は `{"$bytes":[...]}` という予約キーを持つ
//! オブジェクトとして表現します。コマンド引数は JSON テキストと NUL バイトの並びです。

use crate::error::DecodeError;
use crate::value::{PropertyBag, Value};
use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{self, Serialize, SerializeMap, SerializeSeq, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// バイト列を表す予約キー
pub const BYTES_KEY: &str = "$bytes";

/// 引数の区切り
const ARG_TERMINATOR: u8 = 0;

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Int(n) => {
                if let Ok(n) = i64::try_from(*n) {
                    serializer.serialize_i64(n)
                } else if let Ok(n) = u64::try_from(*n) {
                    serializer.serialize_u64(n)
                } else {
                    Err(ser::Error::custom(format!("integer {} does not fit in 64 bits", n)))
                }
            }
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Bytes(bytes) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(BYTES_KEY, bytes)?;
                map.end()
            }
            Value::Bag(bag) => bag.serialize(serializer),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
        }
    }
}

impl Serialize for PropertyBag {
    /// 予約キーを持つバッグはバイト列と区別できないのでエンコードしない
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.get(BYTES_KEY).is_some() {
            return Err(ser::Error::custom(format!(
                "property bag must not use the reserved key `{}`",
                BYTES_KEY
            )));
        }
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (key, value) in self.iter() {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "a protocol value")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_bool<E: de::Error>(self, b: bool) -> Result<Value, E> {
        Ok(Value::Bool(b))
    }

    fn visit_i64<E: de::Error>(self, n: i64) -> Result<Value, E> {
        Ok(Value::Int(n as i128))
    }

    fn visit_u64<E: de::Error>(self, n: u64) -> Result<Value, E> {
        Ok(Value::Int(n as i128))
    }

    fn visit_f64<E: de::Error>(self, n: f64) -> Result<Value, E> {
        Err(E::custom(format!("floating point number {} is not supported", n)))
    }

    fn visit_str<E: de::Error>(self, s: &str) -> Result<Value, E> {
        Ok(Value::Str(s.to_string()))
    }

    fn visit_string<E: de::Error>(self, s: String) -> Result<Value, E> {
        Ok(Value::Str(s))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element::<Value>()? {
            items.push(item);
        }
        Ok(Value::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Value, A::Error> {
        let mut entries = BTreeMap::new();
        while let Some((key, value)) = map.next_entry::<String, Value>()? {
            entries.insert(key, value);
        }

        if entries.len() == 1 {
            if let Some(Value::List(items)) = entries.get(BYTES_KEY) {
                let bytes = items
                    .iter()
                    .map(|item| item.as_int().and_then(|n| u8::try_from(n).ok()))
                    .collect::<Option<Vec<u8>>>()
                    .ok_or_else(|| de::Error::custom("`$bytes` must be a list of bytes"))?;
                return Ok(Value::Bytes(bytes));
            }
        }

        Ok(Value::Bag(entries.into_iter().collect()))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

impl<'de> Deserialize<'de> for PropertyBag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Bag(bag) => Ok(bag),
            other => Err(de::Error::custom(format!(
                "expected property bag, found {}",
                other.kind()
            ))),
        }
    }
}

impl Value {
    /// JSON テキストにエンコードする
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, DecodeError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// JSON テキストからデコードする
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl PropertyBag {
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, DecodeError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// コマンド引数列をエンコードする
///
/// 各引数は JSON テキストの後に NUL バイトが続きます。
pub fn encode_args(args: &[Value]) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    for arg in args {
        serde_json::to_writer(&mut out, arg)?;
        out.push(ARG_TERMINATOR);
    }
    Ok(out)
}

/// コマンド引数列をデコードする
pub fn decode_args(bytes: &[u8]) -> Result<Vec<Value>, DecodeError> {
    let mut args = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        let end = rest
            .iter()
            .position(|&b| b == ARG_TERMINATOR)
            .ok_or_else(|| DecodeError::Json("argument is not NUL terminated".to_string()))?;
        args.push(Value::from_json_slice(&rest[..end])?);
        rest = &rest[end + 1..];
    }
    Ok(args)
}
