//! エラー型
//!
//! コマンドの完了は必ず結果かエラーのどちらかで通知されます。
//! リモート側のエラーは文字列ではなく構造化された [`ErrorReport`] として扱います。

use crate::value::{PropertyBag, Value};
use std::fmt;

/// プロパティバッグ・ワイヤ形式のデコードエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("property `{key}`: expected {expected}, found {found}")]
    PropertyType {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("property `{0}` is required")]
    MissingProperty(String),
    /// 型は合っているが内容を解釈できない
    #[error("property `{key}`: {message}")]
    InvalidProperty { key: String, message: String },
    #[error("reply argument {index}: expected {expected}, found {found}")]
    ArgumentType {
        index: usize,
        expected: &'static str,
        found: &'static str,
    },
    #[error("reply has {found} arguments, expected at least {expected}")]
    MissingArgument { expected: usize, found: usize },
    #[error("number {0} is out of range")]
    OutOfRange(i128),
    #[error("unknown {what} value {value}")]
    UnknownEnumValue { what: &'static str, value: i128 },
    #[error("invalid JSON: {0}")]
    Json(String),
}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        DecodeError::Json(err.to_string())
    }
}

/// 通信路のエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("channel closed")]
    Closed,
    #[error("channel broken: {0}")]
    Broken(String),
}

/// コマンドのコールバックに渡されるエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// エージェントがコマンドを失敗として報告した
    #[error("remote error: {0}")]
    Remote(ErrorReport),
    /// 応答の前にチャネルが閉じた・壊れた
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// 呼び出し側が結果への関心を取り下げた
    #[error("command cancelled")]
    Cancelled,
    /// 応答の形がコマンドの定義と一致しない
    #[error("malformed reply: {0}")]
    MalformedReply(#[from] DecodeError),
}

/// イベントリスナーが報告するエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ListenerError(pub String);

impl ListenerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<DecodeError> for ListenerError {
    fn from(err: DecodeError) -> Self {
        Self(err.to_string())
    }
}

/// エラーコード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ErrorCode(pub i64);

impl ErrorCode {
    pub const OTHER: Self = Self(1);
    pub const JSON_SYNTAX: Self = Self(2);
    pub const PROTOCOL: Self = Self(3);
    pub const BUFFER_OVERFLOW: Self = Self(4);
    pub const CHANNEL_CLOSED: Self = Self(5);
    pub const COMMAND_CANCELLED: Self = Self(6);
    pub const UNKNOWN_PEER: Self = Self(7);
    pub const BASE64: Self = Self(8);
    pub const EOF: Self = Self(9);
    pub const ALREADY_STOPPED: Self = Self(10);
    pub const ALREADY_EXITED: Self = Self(11);
    pub const ALREADY_RUNNING: Self = Self(12);
    pub const ALREADY_ATTACHED: Self = Self(13);
    pub const IS_RUNNING: Self = Self(14);
    pub const INV_DATA_SIZE: Self = Self(15);
    pub const INV_CONTEXT: Self = Self(16);
    pub const INV_ADDRESS: Self = Self(17);
    pub const INV_EXPRESSION: Self = Self(18);
    pub const INV_FORMAT: Self = Self(19);
    pub const INV_NUMBER: Self = Self(20);
    pub const INV_DWARF: Self = Self(21);
    pub const SYM_NOT_FOUND: Self = Self(22);
    pub const UNSUPPORTED: Self = Self(23);
    pub const INV_DATA_TYPE: Self = Self(24);
    pub const INV_COMMAND: Self = Self(25);
    pub const INV_TRANSPORT: Self = Self(26);
    pub const CACHE_MISS: Self = Self(27);
    pub const NOT_ACTIVE: Self = Self(28);

    /// 標準コードの名前
    pub fn name(self) -> Option<&'static str> {
        let name = match self.0 {
            1 => "Other",
            2 => "JsonSyntax",
            3 => "Protocol",
            4 => "BufferOverflow",
            5 => "ChannelClosed",
            6 => "CommandCancelled",
            7 => "UnknownPeer",
            8 => "Base64",
            9 => "Eof",
            10 => "AlreadyStopped",
            11 => "AlreadyExited",
            12 => "AlreadyRunning",
            13 => "AlreadyAttached",
            14 => "IsRunning",
            15 => "InvDataSize",
            16 => "InvContext",
            17 => "InvAddress",
            18 => "InvExpression",
            19 => "InvFormat",
            20 => "InvNumber",
            21 => "InvDwarf",
            22 => "SymNotFound",
            23 => "Unsupported",
            24 => "InvDataType",
            25 => "InvCommand",
            26 => "InvTransport",
            27 => "CacheMiss",
            28 => "NotActive",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "{}", self.0),
        }
    }
}

/// エラーの重大度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Severity {
    #[default]
    Error,
    Warning,
    Fatal,
}

impl Severity {
    fn from_code(code: i64) -> Self {
        match code {
            1 => Severity::Warning,
            2 => Severity::Fatal,
            _ => Severity::Error,
        }
    }

    fn code(self) -> i64 {
        match self {
            Severity::Error => 0,
            Severity::Warning => 1,
            Severity::Fatal => 2,
        }
    }
}

/// エラーレポートのプロパティ名
pub const ERROR_CODE: &str = "Code";
pub const ERROR_TIME: &str = "Time";
pub const ERROR_SERVICE: &str = "Service";
pub const ERROR_FORMAT: &str = "Format";
pub const ERROR_PARAMS: &str = "Params";
pub const ERROR_SEVERITY: &str = "Severity";
pub const ERROR_ALT_CODE: &str = "AltCode";
pub const ERROR_ALT_ORG: &str = "AltOrg";
pub const ERROR_CAUSED_BY: &str = "CausedBy";

/// エージェントから受け取った構造化エラー
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub code: ErrorCode,
    /// 発生時刻（エポックからのミリ秒）
    pub time: Option<u64>,
    pub service: Option<String>,
    /// メッセージテンプレート（`{0}` などのプレースホルダを含む）
    pub format: Option<String>,
    pub params: Vec<Value>,
    pub severity: Severity,
    pub alt_code: Option<i64>,
    pub alt_org: Option<String>,
    pub caused_by: Option<Box<ErrorReport>>,
}

impl ErrorReport {
    pub fn new(code: ErrorCode, format: impl Into<String>) -> Self {
        Self {
            code,
            time: None,
            service: None,
            format: Some(format.into()),
            params: Vec::new(),
            severity: Severity::Error,
            alt_code: None,
            alt_org: None,
            caused_by: None,
        }
    }

    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// プロパティバッグからデコードする
    pub fn from_bag(bag: &PropertyBag) -> Result<Self, DecodeError> {
        let code = bag.get_i64(ERROR_CODE)?.unwrap_or(ErrorCode::OTHER.0);
        let caused_by = match bag.get_bag(ERROR_CAUSED_BY)? {
            Some(cause) => Some(Box::new(Self::from_bag(cause)?)),
            None => None,
        };
        Ok(Self {
            code: ErrorCode(code),
            time: bag.get_u64(ERROR_TIME)?,
            service: bag.get_str(ERROR_SERVICE)?.map(str::to_string),
            format: bag.get_str(ERROR_FORMAT)?.map(str::to_string),
            params: bag.get_list(ERROR_PARAMS)?.map(<[Value]>::to_vec).unwrap_or_default(),
            severity: Severity::from_code(bag.get_i64(ERROR_SEVERITY)?.unwrap_or(0)),
            alt_code: bag.get_i64(ERROR_ALT_CODE)?,
            alt_org: bag.get_str(ERROR_ALT_ORG)?.map(str::to_string),
            caused_by,
        })
    }

    /// 応答のエラースロットをデコードする
    ///
    /// null は成功を意味します。文字列・数値は古いエージェントの形式として受け付けます。
    pub fn from_value(value: &Value) -> Result<Option<Self>, DecodeError> {
        match value {
            Value::Null => Ok(None),
            Value::Bag(bag) => Self::from_bag(bag).map(Some),
            Value::Str(msg) => Ok(Some(Self::new(ErrorCode::OTHER, msg.clone()))),
            Value::Int(code) => {
                let code = i64::try_from(*code).map_err(|_| DecodeError::OutOfRange(*code))?;
                Ok(Some(Self {
                    format: None,
                    ..Self::new(ErrorCode(code), "")
                }))
            }
            other => Err(DecodeError::ArgumentType {
                index: 0,
                expected: "error report",
                found: other.kind(),
            }),
        }
    }

    pub fn to_bag(&self) -> PropertyBag {
        PropertyBag::builder()
            .with(ERROR_CODE, self.code.0)
            .with_opt(ERROR_TIME, self.time)
            .with_opt(ERROR_SERVICE, self.service.clone())
            .with_opt(ERROR_FORMAT, self.format.clone())
            .with_opt(
                ERROR_PARAMS,
                (!self.params.is_empty()).then(|| Value::List(self.params.clone())),
            )
            .with_opt(
                ERROR_SEVERITY,
                (self.severity != Severity::Error).then(|| self.severity.code()),
            )
            .with_opt(ERROR_ALT_CODE, self.alt_code)
            .with_opt(ERROR_ALT_ORG, self.alt_org.clone())
            .with_opt(
                ERROR_CAUSED_BY,
                self.caused_by.as_ref().map(|cause| cause.to_bag()),
            )
            .build()
    }

    /// テンプレートにパラメータを埋め込んだメッセージ
    pub fn message(&self) -> String {
        let Some(format) = &self.format else {
            return format!("error {}", self.code);
        };

        let mut out = String::with_capacity(format.len());
        let mut rest = format.as_str();
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let param = after.find('}').and_then(|close| {
                let index: usize = after[..close].parse().ok()?;
                Some((self.params.get(index)?, close))
            });
            match param {
                Some((value, close)) => {
                    out.push_str(&value.to_string());
                    rest = &after[close + 1..];
                }
                None => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.service {
            Some(service) => write!(f, "{}: {} ({})", service, self.message(), self.code)?,
            None => write!(f, "{} ({})", self.message(), self.code)?,
        }
        if let Some(cause) = &self.caused_by {
            write!(f, "; caused by: {}", cause)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_substitutes_params() {
        let report = ErrorReport::new(ErrorCode::INV_CONTEXT, "Invalid context {0} in {1}")
            .with_params(vec!["P1".into(), 7.into()]);
        assert_eq!(report.message(), "Invalid context P1 in 7");
    }

    #[test]
    fn test_message_keeps_unknown_placeholders() {
        let report = ErrorReport::new(ErrorCode::OTHER, "value {3} {x}");
        assert_eq!(report.message(), "value {3} {x}");
    }

    #[test]
    fn test_bag_round_trip_with_cause() {
        let mut report = ErrorReport::new(ErrorCode::SYM_NOT_FOUND, "Symbol not found")
            .with_service("Symbols");
        report.time = Some(1_700_000_000_000);
        report.severity = Severity::Warning;
        report.caused_by = Some(Box::new(ErrorReport::new(ErrorCode::INV_DWARF, "bad DWARF")));

        let decoded = ErrorReport::from_bag(&report.to_bag()).unwrap();
        assert_eq!(decoded, report);
        assert!(decoded.to_string().contains("caused by: bad DWARF"));
    }

    #[test]
    fn test_error_slot_forms() {
        assert_eq!(ErrorReport::from_value(&Value::Null).unwrap(), None);

        let legacy = ErrorReport::from_value(&Value::Str("boom".into())).unwrap().unwrap();
        assert_eq!(legacy.code, ErrorCode::OTHER);
        assert_eq!(legacy.message(), "boom");

        let numeric = ErrorReport::from_value(&Value::Int(25)).unwrap().unwrap();
        assert_eq!(numeric.code, ErrorCode::INV_COMMAND);
        assert_eq!(numeric.message(), "error InvCommand");

        assert!(ErrorReport::from_value(&Value::Bool(true)).is_err());
    }
}
