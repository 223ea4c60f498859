//! コマンドディスパッチャ
//!
//! [`Channel`] はコマンドを送信してトークンを即座に返し、[`DispatchLoop`] が
//! 受信キューを順に処理してトークンごとにちょうど一度だけコールバックを呼び出します。
//!
//! コールバックとイベント配送は常にディスパッチループ側で行われ、`send` や
//! `cancel` の内部から呼ばれることはありません。

use crate::error::{CommandError, ErrorReport, TransportError};
use crate::events::{EventListener, EventRegistry, ListenerId};
use crate::token::{next_channel_id, Token, NO_CHANNEL};
use crate::value::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// 送信側の外部インターフェース
///
/// バイト列のフレーミングや接続管理は実装側の責務です。
pub trait Transport: Send + Sync {
    fn send_command(
        &self,
        token: Token,
        service: &str,
        verb: &str,
        args: &[Value],
    ) -> Result<(), TransportError>;
}

/// チャネルの設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// 完了済みトークンへの二重応答をパニックにする
    pub strict_replies: bool,
    /// 応答の来ないキャンセル済みトークンを覚えておく最大数
    pub cancelled_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            strict_replies: cfg!(debug_assertions),
            cancelled_capacity: 1024,
        }
    }
}

/// コマンドの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Sent,
    Completed,
    Cancelled,
}

/// 完了コールバック
pub type ReplyCallback = Box<dyn FnOnce(Token, Result<Vec<Value>, CommandError>) + Send>;

/// 受信メッセージ
#[derive(Debug, Clone)]
pub enum Inbound {
    /// コマンドへの応答（先頭はエラースロット）
    Reply { token: Token, args: Vec<Value> },
    /// エージェントがコマンド自体を受け付けなかった
    Rejected { token: Token, error: ErrorReport },
    /// 非同期イベント
    Event {
        service: String,
        name: String,
        args: Vec<Value>,
    },
    /// 通信路が閉じた
    Closed(TransportError),
}

enum Message {
    Inbound(Inbound),
    Abort { token: Token, error: CommandError },
    Deliver(Token),
}

type Outcome = Result<Vec<Value>, CommandError>;

struct PendingCommand {
    service: String,
    verb: String,
    state: CommandState,
    /// `send` が戻る準備ができた
    armed: bool,
    /// 準備前に届いた結果
    parked: Option<Outcome>,
    /// キャンセル後に応答が届いた
    reply_seen: bool,
    done: ReplyCallback,
}

#[derive(Default)]
struct ChannelState {
    next_seq: u64,
    pending: HashMap<Token, PendingCommand>,
    /// 応答待ちのままキャンセルが完了したトークン（古い順）
    cancelled: BTreeSet<Token>,
    /// 記録から追い出した最大の連番
    forgotten_seq: Option<u64>,
    closed: Option<TransportError>,
}

struct Shared {
    id: u32,
    transport: Arc<dyn Transport>,
    config: ChannelConfig,
    state: Mutex<ChannelState>,
    events: EventRegistry,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn issued(&self, state: &ChannelState, token: Token) -> bool {
        token.channel() == self.id && token.seq() < state.next_seq
    }
}

impl ChannelState {
    /// キャンセル済みトークンを記録する（上限を超えたら古いものから忘れる）
    fn remember_cancelled(&mut self, token: Token, capacity: usize) {
        self.cancelled.insert(token);
        while self.cancelled.len() > capacity {
            let Some(oldest) = self.cancelled.pop_first() else {
                break;
            };
            debug!("Forgetting cancelled token {} without reply", oldest);
            self.forgotten_seq = Some(self.forgotten_seq.map_or(oldest.seq(), |s| s.max(oldest.seq())));
        }
    }

    /// 記録から追い出したキャンセル済みトークンかもしれない
    fn maybe_forgotten(&self, token: Token) -> bool {
        self.forgotten_seq.is_some_and(|seq| token.seq() <= seq)
    }
}

/// コマンドチャネル
///
/// クローンは同じチャネルを共有します。
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
    queue: mpsc::UnboundedSender<Message>,
}

impl Channel {
    /// チャネルとそのディスパッチループを作成する
    pub fn new(transport: Arc<dyn Transport>, config: ChannelConfig) -> (Channel, DispatchLoop) {
        let (queue, rx) = mpsc::unbounded_channel();
        // 番号を使い切った場合は閉じたチャネルとして作り、送信は全て失敗させる
        let (id, closed) = match next_channel_id() {
            Some(id) => (id, None),
            None => {
                warn!("Channel ids exhausted; creating a closed channel");
                (
                    NO_CHANNEL,
                    Some(TransportError::Broken("channel ids exhausted".to_string())),
                )
            }
        };
        let shared = Arc::new(Shared {
            id,
            transport,
            config,
            state: Mutex::new(ChannelState {
                closed,
                ..ChannelState::default()
            }),
            events: EventRegistry::new(),
        });
        let channel = Channel {
            shared: shared.clone(),
            queue,
        };
        (channel, DispatchLoop { shared, rx })
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn config(&self) -> ChannelConfig {
        self.shared.config
    }

    /// コマンドを送信する
    ///
    /// # Arguments
    /// * `service` - サービス名
    /// * `verb` - コマンド名
    /// * `args` - 引数
    /// * `done` - 完了時に一度だけ呼ばれるコールバック
    pub fn send(&self, service: &str, verb: &str, args: Vec<Value>, done: ReplyCallback) -> Token {
        let (token, closed) = {
            let mut state = self.shared.lock();
            let token = Token::new(self.shared.id, state.next_seq);
            state.next_seq += 1;
            state.pending.insert(
                token,
                PendingCommand {
                    service: service.to_string(),
                    verb: verb.to_string(),
                    state: CommandState::Sent,
                    armed: false,
                    parked: None,
                    reply_seen: false,
                    done,
                },
            );
            (token, state.closed.clone())
        };

        debug!("Sending {}.{} as token {}", service, verb, token);

        let failure = match closed {
            Some(err) => Some(err),
            None => self
                .shared
                .transport
                .send_command(token, service, verb, &args)
                .err(),
        };
        if let Some(err) = failure {
            debug!("Token {} failed before reply: {}", token, err);
            self.post(Message::Abort {
                token,
                error: CommandError::Transport(err),
            });
        }

        self.arm(token);
        token
    }

    fn arm(&self, token: Token) {
        let mut state = self.shared.lock();
        if let Some(entry) = state.pending.get_mut(&token) {
            entry.armed = true;
            if entry.parked.is_some() {
                drop(state);
                self.post(Message::Deliver(token));
            }
        }
    }

    fn post(&self, message: Message) {
        if let Err(mpsc::error::SendError(message)) = self.queue.send(message) {
            let what = match message {
                Message::Abort { token, .. } => format!("abort of token {}", token),
                Message::Deliver(token) => format!("delivery of token {}", token),
                Message::Inbound(_) => "inbound message".to_string(),
            };
            warn!("Dispatch loop of channel {} is gone; {} dropped", self.shared.id, what);
        }
    }

    /// コマンドをキャンセルする
    ///
    /// ローカルでのコールバック配送を止めるだけで、リモート側の実行は止まりません。
    /// 応答待ちのトークンに対してのみ `true` を返します。
    pub fn cancel(&self, token: Token) -> bool {
        let mut state = self.shared.lock();
        let Some(entry) = state.pending.get_mut(&token) else {
            return false;
        };
        if entry.state != CommandState::Sent {
            return false;
        }
        entry.state = CommandState::Cancelled;
        debug!("Cancelled {}.{} (token {})", entry.service, entry.verb, token);
        drop(state);

        self.post(Message::Abort {
            token,
            error: CommandError::Cancelled,
        });
        true
    }

    /// 受信メッセージの投入口を取得する
    pub fn inbound(&self) -> InboundSender {
        InboundSender {
            queue: self.queue.clone(),
        }
    }

    /// チャネルを閉じる
    ///
    /// 応答待ちのコマンドは次のディスパッチで `TransportError::Closed` になります。
    pub fn close(&self) {
        self.post(Message::Inbound(Inbound::Closed(TransportError::Closed)));
    }

    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// 応答を待たずにキャンセルを終えたトークンの記録数
    pub fn cancelled_count(&self) -> usize {
        self.shared.lock().cancelled.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed.is_some()
    }

    /// トークンの状態を取得する
    ///
    /// このチャネルが発行していないトークンには `None` を返します。
    pub fn command_state(&self, token: Token) -> Option<CommandState> {
        let state = self.shared.lock();
        if let Some(entry) = state.pending.get(&token) {
            return Some(entry.state);
        }
        if state.cancelled.contains(&token) {
            return Some(CommandState::Cancelled);
        }
        self.shared
            .issued(&state, token)
            .then_some(CommandState::Completed)
    }

    pub fn add_event_listener(&self, service: &str, listener: Arc<dyn EventListener>) -> ListenerId {
        self.shared.events.add(service, listener)
    }

    pub fn remove_event_listener(&self, service: &str, id: ListenerId) -> bool {
        self.shared.events.remove(service, id)
    }
}

/// 受信メッセージをディスパッチループへ渡す
#[derive(Clone)]
pub struct InboundSender {
    queue: mpsc::UnboundedSender<Message>,
}

impl InboundSender {
    /// メッセージを投入する（ループが終了していれば `false`）
    pub fn send(&self, inbound: Inbound) -> bool {
        self.queue.send(Message::Inbound(inbound)).is_ok()
    }

    pub fn reply(&self, token: Token, args: Vec<Value>) -> bool {
        self.send(Inbound::Reply { token, args })
    }

    pub fn reject(&self, token: Token, error: ErrorReport) -> bool {
        self.send(Inbound::Rejected { token, error })
    }

    pub fn event(&self, service: &str, name: &str, args: Vec<Value>) -> bool {
        self.send(Inbound::Event {
            service: service.to_string(),
            name: name.to_string(),
            args,
        })
    }

    pub fn closed(&self, err: TransportError) -> bool {
        self.send(Inbound::Closed(err))
    }
}

/// ディスパッチループ
///
/// チャネルごとに一つだけ存在し、受信キューを唯一消費します。
pub struct DispatchLoop {
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl DispatchLoop {
    /// すべての送信側が破棄されるまでメッセージを処理する
    ///
    /// 終了時に応答待ちのコマンドは `TransportError::Closed` で完了します。
    pub async fn run(mut self) {
        while let Some(message) = self.rx.recv().await {
            self.process(message);
        }
        self.finish();
    }

    /// 現時点でキューにあるメッセージをすべて処理する
    ///
    /// 処理したメッセージ数を返します。処理中に投入されたメッセージも含みます。
    pub fn turn(&mut self) -> usize {
        let mut count = 0;
        loop {
            match self.rx.try_recv() {
                Ok(message) => {
                    self.process(message);
                    count += 1;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.finish();
                    break;
                }
            }
        }
        count
    }

    fn finish(&mut self) {
        let open = self.shared.lock().closed.is_none();
        if open {
            self.on_closed(TransportError::Closed);
        }
    }

    fn process(&mut self, message: Message) {
        match message {
            Message::Inbound(Inbound::Reply { token, args }) => self.on_result(token, Ok(args)),
            Message::Inbound(Inbound::Rejected { token, error }) => {
                self.on_result(token, Err(CommandError::Remote(error)))
            }
            Message::Inbound(Inbound::Event {
                service,
                name,
                args,
            }) => {
                debug!("Event {}.{}", service, name);
                self.shared.events.dispatch(&service, &name, &args);
            }
            Message::Inbound(Inbound::Closed(err)) => self.on_closed(err),
            Message::Abort { token, error } => self.on_abort(token, error),
            Message::Deliver(token) => self.on_deliver(token),
        }
    }

    fn on_result(&mut self, token: Token, outcome: Outcome) {
        let mut state = self.shared.lock();

        if let Some(entry) = state.pending.get_mut(&token) {
            match entry.state {
                CommandState::Cancelled => {
                    debug!("Dropping reply for cancelled token {}", token);
                    entry.reply_seen = true;
                }
                CommandState::Completed => {
                    drop(state);
                    self.duplicate_reply(token);
                }
                CommandState::Sent if entry.armed => {
                    if let Some(entry) = state.pending.remove(&token) {
                        drop(state);
                        debug!("Completed {}.{} (token {})", entry.service, entry.verb, token);
                        (entry.done)(token, outcome);
                    }
                }
                CommandState::Sent => {
                    entry.state = CommandState::Completed;
                    entry.parked = Some(outcome);
                }
            }
            return;
        }

        if state.cancelled.remove(&token) {
            debug!("Dropping late reply for cancelled token {}", token);
            return;
        }

        if self.shared.issued(&state, token) {
            if state.maybe_forgotten(token) {
                debug!("Dropping reply for token {} older than the cancellation record", token);
                return;
            }
            drop(state);
            self.duplicate_reply(token);
        } else {
            warn!("Reply for unknown token {} ignored", token);
        }
    }

    fn duplicate_reply(&self, token: Token) {
        if self.shared.config.strict_replies {
            panic!("duplicate reply for completed token {}", token);
        }
        warn!("Duplicate reply for completed token {} ignored", token);
    }

    fn on_abort(&mut self, token: Token, error: CommandError) {
        let mut state = self.shared.lock();
        let Some(entry) = state.pending.get_mut(&token) else {
            return;
        };
        // 先に届いた結果は Deliver で配送される
        if entry.parked.is_some() {
            return;
        }

        let outcome = match entry.state {
            CommandState::Cancelled => Err(CommandError::Cancelled),
            _ => Err(error),
        };

        if !entry.armed {
            entry.parked = Some(outcome);
            return;
        }

        if let Some(entry) = state.pending.remove(&token) {
            if entry.state == CommandState::Cancelled && !entry.reply_seen && state.closed.is_none() {
                let capacity = self.shared.config.cancelled_capacity;
                state.remember_cancelled(token, capacity);
            }
            drop(state);
            (entry.done)(token, outcome);
        }
    }

    fn on_deliver(&mut self, token: Token) {
        let mut state = self.shared.lock();
        let ready = state
            .pending
            .get(&token)
            .is_some_and(|e| e.armed && e.parked.is_some());
        if !ready {
            return;
        }
        if let Some(mut entry) = state.pending.remove(&token) {
            drop(state);
            let outcome = match entry.state {
                CommandState::Cancelled => Some(Err(CommandError::Cancelled)),
                _ => entry.parked.take(),
            };
            if let Some(outcome) = outcome {
                (entry.done)(token, outcome);
            }
        }
    }

    fn on_closed(&mut self, err: TransportError) {
        let mut fired = Vec::new();
        {
            let mut state = self.shared.lock();
            if state.closed.is_none() {
                debug!("Channel {} closed: {}", self.shared.id, err);
                state.closed = Some(err.clone());
            }
            state.cancelled.clear();

            let tokens: Vec<Token> = state.pending.keys().copied().collect();
            for token in tokens {
                let Some(entry) = state.pending.get_mut(&token) else {
                    continue;
                };
                let outcome = match entry.state {
                    CommandState::Cancelled => Err(CommandError::Cancelled),
                    _ => Err(CommandError::Transport(err.clone())),
                };
                if !entry.armed {
                    if entry.parked.is_none() {
                        entry.parked = Some(outcome);
                    }
                    continue;
                }
                if let Some(mut entry) = state.pending.remove(&token) {
                    let outcome = entry.parked.take().unwrap_or(outcome);
                    fired.push((token, entry.done, outcome));
                }
            }
        }

        fired.sort_by_key(|(token, _, _)| *token);
        for (token, done, outcome) in fired {
            done(token, outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackTransport;

    fn record() -> (Arc<Mutex<Vec<Outcome>>>, ReplyCallback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let done: ReplyCallback = Box::new(move |_token, outcome| sink.lock().unwrap().push(outcome));
        (log, done)
    }

    #[test]
    fn test_callback_fires_on_dispatch_turn() {
        let transport = LoopbackTransport::new();
        let (channel, mut dispatch) = Channel::new(transport.clone(), ChannelConfig::default());
        let (log, done) = record();

        let token = channel.send("Registers", "get", vec!["R0".into()], done);
        assert_eq!(channel.command_state(token), Some(CommandState::Sent));
        assert_eq!(transport.sent().len(), 1);

        channel.inbound().reply(token, vec![Value::Null, vec![1u8, 2].into()]);
        assert!(log.lock().unwrap().is_empty());

        dispatch.turn();
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(channel.command_state(token), Some(CommandState::Completed));
        assert_eq!(channel.pending_count(), 0);
    }

    #[test]
    fn test_cancel_twice_returns_false() {
        let transport = LoopbackTransport::new();
        let (channel, mut dispatch) = Channel::new(transport, ChannelConfig::default());
        let (log, done) = record();

        let token = channel.send("Breakpoints", "getIDs", vec![], done);
        assert!(channel.cancel(token));
        assert!(!channel.cancel(token));

        dispatch.turn();
        assert_eq!(*log.lock().unwrap(), vec![Err(CommandError::Cancelled)]);
        assert!(!channel.cancel(token));
    }

    #[test]
    fn test_tolerant_duplicate_reply_is_ignored() {
        let transport = LoopbackTransport::new();
        let (channel, mut dispatch) =
            Channel::new(transport, ChannelConfig {
                strict_replies: false,
                ..ChannelConfig::default()
            });
        let (log, done) = record();

        let token = channel.send("Symbols", "getContext", vec!["S1".into()], done);
        channel.inbound().reply(token, vec![Value::Null]);
        channel.inbound().reply(token, vec![Value::Null]);
        dispatch.turn();

        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_post_after_dispatch_loop_dropped() {
        let transport = LoopbackTransport::new();
        let (channel, dispatch) = Channel::new(transport, ChannelConfig::default());
        let token = channel.send("Registers", "get", vec![Value::from("R0")], Box::new(|_, _| {}));
        drop(dispatch);

        // 配送先が無くてもパニックせず、状態は Cancelled になる
        assert!(channel.cancel(token));
        assert_eq!(channel.command_state(token), Some(CommandState::Cancelled));
        channel.close();
        assert!(!channel.inbound().reply(token, vec![Value::Null]));
    }

    #[test]
    fn test_new_channels_get_distinct_ids() {
        let (a, _da) = Channel::new(LoopbackTransport::new(), ChannelConfig::default());
        let (b, _db) = Channel::new(LoopbackTransport::new(), ChannelConfig::default());
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), NO_CHANNEL);
        assert!(!a.is_closed());
    }

    #[test]
    fn test_reply_for_foreign_token_is_ignored() {
        let transport = LoopbackTransport::new();
        let (channel, mut dispatch) =
            Channel::new(transport, ChannelConfig {
                strict_replies: true,
                ..ChannelConfig::default()
            });
        channel.inbound().reply(Token::new(u32::MAX >> 8, 0), vec![Value::Null]);
        assert_eq!(dispatch.turn(), 1);
    }
}
