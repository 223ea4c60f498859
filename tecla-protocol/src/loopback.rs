//! ループバック通信路
//!
//! 送信されたコマンドをワイヤ形式に通して記録します。テストや組み込み用途で、
//! エージェントの応答・イベントを決定的に再現するために使います。

use crate::channel::Transport;
use crate::codec::{decode_args, encode_args};
use crate::error::TransportError;
use crate::token::Token;
use crate::value::Value;
use std::sync::{Arc, Mutex, PoisonError};

/// 記録されたコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentCommand {
    pub token: Token,
    pub service: String,
    pub verb: String,
    pub args: Vec<Value>,
}

#[derive(Default)]
pub struct LoopbackTransport {
    sent: Mutex<Vec<SentCommand>>,
    failure: Mutex<Option<TransportError>>,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 以降の送信を指定したエラーで失敗させる
    pub fn fail_with(&self, err: TransportError) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
    }

    pub fn sent(&self) -> Vec<SentCommand> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// 記録を取り出して空にする
    pub fn take_sent(&self) -> Vec<SentCommand> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn last(&self) -> Option<SentCommand> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

impl Transport for LoopbackTransport {
    fn send_command(
        &self,
        token: Token,
        service: &str,
        verb: &str,
        args: &[Value],
    ) -> Result<(), TransportError> {
        if let Some(err) = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(err);
        }

        let wire = encode_args(args).map_err(|e| TransportError::Broken(e.to_string()))?;
        let args = decode_args(&wire).map_err(|e| TransportError::Broken(e.to_string()))?;
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SentCommand {
                token,
                service: service.to_string(),
                verb: verb.to_string(),
                args,
            });
        Ok(())
    }
}
