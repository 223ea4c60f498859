//! Tecla プロトコルランタイム
//!
//! このクレートは、リモートデバッグエージェントと通信するための基盤を提供します。
//! プロパティバッグ、JSON ワイヤ形式、構造化エラー、コマンドディスパッチャ、
//! イベントレジストリを含みます。

pub mod channel;
pub mod codec;
pub mod error;
pub mod events;
pub mod loopback;
pub mod token;
pub mod value;

pub use channel::{
    Channel, ChannelConfig, CommandState, DispatchLoop, Inbound, InboundSender, ReplyCallback,
    Transport,
};
pub use codec::{decode_args, encode_args};
pub use error::{
    CommandError, DecodeError, ErrorCode, ErrorReport, ListenerError, Severity, TransportError,
};
pub use events::{EventListener, EventRegistry, ListenerId};
pub use loopback::{LoopbackTransport, SentCommand};
pub use token::{ParseTokenError, Token};
pub use value::{PropertyBag, PropertyBagBuilder, Value};
