//! サービスファサードの共通部分
//!
//! 各サービスの操作は同じ形をしています。入力を検証して引数に変換し、
//! コマンドを一つだけ送信し、応答をデコードして型付きの結果にします。
//! 応答引数の先頭は常にエラースロットです。

use crate::context::ContextId;
use std::sync::{Arc, Mutex, PoisonError};
use tecla_protocol::{
    Channel, CommandError, DecodeError, ErrorReport, EventListener, ListenerId, PropertyBag, Token,
    Value,
};
use tracing::debug;

/// 完了コールバック
pub type Done<T> = Box<dyn FnOnce(Token, Result<T, CommandError>) + Send>;

/// チャネル上の一つのサービス
#[derive(Clone)]
pub struct RemoteService {
    channel: Channel,
    name: &'static str,
}

impl RemoteService {
    pub fn new(channel: Channel, name: &'static str) -> Self {
        Self { channel, name }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// コマンドを送信する
    ///
    /// # Arguments
    /// * `verb` - コマンド名
    /// * `args` - コマンド引数
    /// * `decode` - エラースロットより後ろの応答引数をデコードする関数
    /// * `done` - 完了コールバック
    pub fn command<T, F>(&self, verb: &str, args: Vec<Value>, decode: F, done: Done<T>) -> Token
    where
        T: 'static,
        F: FnOnce(&mut ReplyReader<'_>) -> Result<T, DecodeError> + Send + 'static,
    {
        let service = self.name;
        let name = verb.to_string();
        self.channel.send(
            service,
            verb,
            args,
            Box::new(move |token, result| {
                let outcome = result.and_then(|args| {
                    let mut reader = ReplyReader::new(&args);
                    if let Some(report) = reader.error()? {
                        return Err(CommandError::Remote(report));
                    }
                    Ok(decode(&mut reader)?)
                });
                if let Err(err) = &outcome {
                    debug!("{}.{} ({}) failed: {}", service, name, token, err);
                }
                done(token, outcome)
            }),
        )
    }

    pub fn cancel(&self, token: Token) -> bool {
        self.channel.cancel(token)
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        self.channel.add_event_listener(self.name, listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.channel.remove_event_listener(self.name, id)
    }
}

/// 応答・イベント引数を先頭から順に読み出す
pub struct ReplyReader<'a> {
    args: &'a [Value],
    pos: usize,
}

impl<'a> ReplyReader<'a> {
    pub fn new(args: &'a [Value]) -> Self {
        Self { args, pos: 0 }
    }

    /// 次に読む引数の位置
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.args.len().saturating_sub(self.pos)
    }

    fn mismatch(&self, expected: &'static str, found: &Value) -> DecodeError {
        DecodeError::ArgumentType {
            index: self.pos - 1,
            expected,
            found: found.kind(),
        }
    }

    /// 次の引数を取得する
    pub fn value(&mut self) -> Result<&'a Value, DecodeError> {
        let value = self.args.get(self.pos).ok_or(DecodeError::MissingArgument {
            expected: self.pos + 1,
            found: self.args.len(),
        })?;
        self.pos += 1;
        Ok(value)
    }

    /// エラースロットを読む
    ///
    /// null は成功、バッグは構造化エラー、文字列・数値は旧形式のエラーです。
    pub fn error(&mut self) -> Result<Option<ErrorReport>, DecodeError> {
        let value = self.value()?;
        ErrorReport::from_value(value)
    }

    pub fn bag(&mut self) -> Result<PropertyBag, DecodeError> {
        Ok(self.opt_bag()?.unwrap_or_default())
    }

    pub fn opt_bag(&mut self) -> Result<Option<PropertyBag>, DecodeError> {
        match self.value()? {
            Value::Null => Ok(None),
            Value::Bag(bag) => Ok(Some(bag.clone())),
            other => Err(self.mismatch("property bag", other)),
        }
    }

    pub fn string(&mut self) -> Result<String, DecodeError> {
        match self.value()? {
            Value::Str(s) => Ok(s.clone()),
            other => Err(self.mismatch("string", other)),
        }
    }

    pub fn opt_string(&mut self) -> Result<Option<String>, DecodeError> {
        match self.value()? {
            Value::Null => Ok(None),
            Value::Str(s) => Ok(Some(s.clone())),
            other => Err(self.mismatch("string", other)),
        }
    }

    pub fn id(&mut self) -> Result<ContextId, DecodeError> {
        self.string().map(ContextId::from)
    }

    pub fn int(&mut self) -> Result<i128, DecodeError> {
        match self.value()? {
            Value::Int(n) => Ok(*n),
            other => Err(self.mismatch("integer", other)),
        }
    }

    pub fn u64(&mut self) -> Result<u64, DecodeError> {
        let n = self.int()?;
        u64::try_from(n).map_err(|_| DecodeError::OutOfRange(n))
    }

    pub fn bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        match self.value()? {
            Value::Null => Ok(Vec::new()),
            Value::Bytes(b) => Ok(b.clone()),
            other => Err(self.mismatch("bytes", other)),
        }
    }

    /// リストを取得する（null は空リスト）
    pub fn list(&mut self) -> Result<&'a [Value], DecodeError> {
        match self.value()? {
            Value::Null => Ok(&[]),
            Value::List(items) => Ok(items),
            other => Err(self.mismatch("list", other)),
        }
    }

    /// ID リストを取得する（null は空リスト）
    pub fn ids(&mut self) -> Result<Vec<ContextId>, DecodeError> {
        let items = self.list()?;
        items
            .iter()
            .map(|item| match item {
                Value::Str(s) => Ok(ContextId::from(s.as_str())),
                other => Err(self.mismatch("list of strings", other)),
            })
            .collect()
    }

    pub fn bags(&mut self) -> Result<Vec<PropertyBag>, DecodeError> {
        let items = self.list()?;
        items
            .iter()
            .map(|item| match item {
                Value::Bag(bag) => Ok(bag.clone()),
                other => Err(self.mismatch("list of property bags", other)),
            })
            .collect()
    }
}

/// 型付きリスナーの登録表
///
/// 型付きリスナーはアダプタで包んでイベントレジストリに登録されるため、
/// 同じリスナーの二重登録はここで検出します。
pub(crate) struct Subscriptions<L: ?Sized> {
    entries: Mutex<Vec<(Arc<L>, ListenerId)>>,
}

impl<L: ?Sized> Default for Subscriptions<L> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<L: ?Sized> Subscriptions<L> {
    pub(crate) fn add(
        &self,
        service: &RemoteService,
        listener: Arc<L>,
        adapt: impl FnOnce(Arc<L>) -> Arc<dyn EventListener>,
    ) -> ListenerId {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let key = Arc::as_ptr(&listener) as *const ();
        if let Some((_, id)) = entries.iter().find(|(l, _)| Arc::as_ptr(l) as *const () == key) {
            return *id;
        }
        let id = service.add_listener(adapt(Arc::clone(&listener)));
        entries.push((listener, id));
        id
    }

    pub(crate) fn remove(&self, service: &RemoteService, id: ListenerId) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(pos) = entries.iter().position(|(_, l)| *l == id) else {
            return false;
        };
        entries.remove(pos);
        service.remove_listener(id)
    }
}
