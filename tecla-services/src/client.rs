//! クライアント
//!
//! 一つのチャネルの上に各サービスのプロキシをまとめます。

use crate::breakpoints::BreakpointsProxy;
use crate::context::StateChange;
use crate::registers::RegistersProxy;
use crate::symbols::SymbolsProxy;
use tecla_protocol::Channel;
use tracing::debug;

/// チャネルごとのサービス一式
#[derive(Clone)]
pub struct Client {
    channel: Channel,
    breakpoints: BreakpointsProxy,
    registers: RegistersProxy,
    symbols: SymbolsProxy,
}

impl Client {
    pub fn new(channel: Channel) -> Self {
        Self {
            breakpoints: BreakpointsProxy::new(channel.clone()),
            registers: RegistersProxy::new(channel.clone()),
            symbols: SymbolsProxy::new(channel.clone()),
            channel,
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn breakpoints(&self) -> &BreakpointsProxy {
        &self.breakpoints
    }

    pub fn registers(&self) -> &RegistersProxy {
        &self.registers
    }

    pub fn symbols(&self) -> &SymbolsProxy {
        &self.symbols
    }

    /// ターゲットの状態変化を全キャッシュに通知する
    ///
    /// 無効化したエントリの総数を返します。
    pub fn notify(&self, change: StateChange) -> usize {
        let removed = self.breakpoints.cache().on_state_change(&change)
            + self.registers.cache().on_state_change(&change)
            + self.symbols.cache().on_state_change(&change);
        debug!("{:?}: {} entries invalidated", change, removed);
        removed
    }
}
