//! Tecla サービス層
//!
//! このクレートは、コマンドディスパッチャの上に Breakpoints・Registers・Symbols の
//! 各サービスを型付きで提供します。応答はデコードした直後に型付きの構造体へ変換し、
//! コンテキストはサービスごとのキャッシュで管理します。

pub mod breakpoints;
pub mod client;
pub mod context;
pub mod error;
pub mod facade;
pub mod registers;
pub mod symbols;

pub use breakpoints::{
    AccessMode, Breakpoint, BreakpointInstance, BreakpointStatus, BreakpointType, Breakpoints,
    BreakpointsListener, BreakpointsProxy, Capabilities,
};
pub use client::Client;
pub use context::{Context, ContextCache, ContextId, StateChange, UpdatePolicy};
pub use error::{ArgumentError, CacheInconsistency};
pub use facade::{Done, RemoteService, ReplyReader};
pub use registers::{
    Location as RegisterLocation, NamedValue, RegisterRole, Registers, RegistersContext,
    RegistersListener, RegistersProxy, SearchFilter,
};
pub use symbols::{
    FrameInfo, LocationInfo, Symbol, SymbolClass, SymbolFlags, Symbols, SymbolsProxy, TypeClass,
};
