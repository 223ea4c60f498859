//! Registers サービス
//!
//! レジスタはレジスタグループ・レジスタ・ビットフィールドの階層を持つ
//! コンテキストとして公開されます。値はバイト列でやり取りします。

use crate::context::{opt_id, Context, ContextCache, ContextId, StateChange, UpdatePolicy};
use crate::error::ArgumentError;
use crate::facade::{Done, RemoteService, ReplyReader, Subscriptions};
use std::fmt;
use std::sync::Arc;
use tecla_protocol::{
    Channel, DecodeError, EventListener, ListenerError, ListenerId, PropertyBag, Token, Value,
};
use tracing::debug;

pub const SERVICE: &str = "Registers";

pub const PROP_ID: &str = "ID";
pub const PROP_PARENT_ID: &str = "ParentID";
pub const PROP_PROCESS_ID: &str = "ProcessID";
pub const PROP_NAME: &str = "Name";
pub const PROP_DESCRIPTION: &str = "Description";
pub const PROP_SIZE: &str = "Size";
pub const PROP_READABLE: &str = "Readable";
pub const PROP_READ_ONCE: &str = "ReadOnce";
pub const PROP_WRITEABLE: &str = "Writeable";
pub const PROP_WRITE_ONCE: &str = "WriteOnce";
pub const PROP_SIDE_EFFECTS: &str = "SideEffects";
pub const PROP_VOLATILE: &str = "Volatile";
pub const PROP_FLOAT: &str = "Float";
pub const PROP_BIG_ENDIAN: &str = "BigEndian";
pub const PROP_LEFT_TO_RIGHT: &str = "LeftToRight";
pub const PROP_FIRST_BIT: &str = "FirstBit";
pub const PROP_BITS: &str = "Bits";
pub const PROP_VALUES: &str = "Values";
pub const PROP_MEMORY_ADDRESS: &str = "MemoryAddress";
pub const PROP_MEMORY_CONTEXT: &str = "MemoryContext";
pub const PROP_CAN_SEARCH: &str = "CanSearch";
pub const PROP_ROLE: &str = "Role";
pub const PROP_OFFSET: &str = "Offset";

/// 名前付き値のプロパティ
pub const VALUE_VALUE: &str = "Value";
pub const VALUE_NAME: &str = "Name";
pub const VALUE_DESCRIPTION: &str = "Description";

pub const SEARCH_NAME: &str = "Name";
pub const SEARCH_EQUAL_VALUE: &str = "EqualValue";

pub const EVENT_CONTEXT_CHANGED: &str = "contextChanged";
pub const EVENT_REGISTER_CHANGED: &str = "registerChanged";
pub const EVENT_CONTEXT_ADDED: &str = "contextAdded";
pub const EVENT_CONTEXT_REMOVED: &str = "contextRemoved";

/// レジスタの役割
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RegisterRole {
    /// プログラムカウンタ
    Pc,
    /// スタックポインタ
    Sp,
    /// フレームポインタ
    Fp,
    /// 戻り値
    Ret,
    /// コア番号
    Core,
    Other(String),
}

impl RegisterRole {
    pub fn parse(text: &str) -> Self {
        match text {
            "PC" => Self::Pc,
            "SP" => Self::Sp,
            "FP" => Self::Fp,
            "RET" => Self::Ret,
            "CORE" => Self::Core,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Pc => "PC",
            Self::Sp => "SP",
            Self::Fp => "FP",
            Self::Ret => "RET",
            Self::Core => "CORE",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for RegisterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 列挙値の注釈（ビットフィールドの取りうる値など）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedValue {
    pub value: Vec<u8>,
    pub name: Option<String>,
    pub description: Option<String>,
}

impl NamedValue {
    pub fn from_bag(bag: &PropertyBag) -> Result<Self, DecodeError> {
        Ok(Self {
            value: bag.get_bytes(VALUE_VALUE)?.map(<[u8]>::to_vec).unwrap_or_default(),
            name: bag.get_str(VALUE_NAME)?.map(str::to_string),
            description: bag.get_str(VALUE_DESCRIPTION)?.map(str::to_string),
        })
    }
}

/// レジスタ値のアドレス指定（コンテキストID・バイトオフセット・バイトサイズ）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    pub id: ContextId,
    pub offset: u64,
    pub size: u64,
}

impl Location {
    pub fn new(id: impl Into<ContextId>, offset: u64, size: u64) -> Self {
        Self {
            id: id.into(),
            offset,
            size,
        }
    }
}

impl From<&Location> for Value {
    fn from(loc: &Location) -> Self {
        Value::List(vec![(&loc.id).into(), loc.offset.into(), loc.size.into()])
    }
}

fn locations(locs: &[Location]) -> Value {
    Value::list(locs.iter())
}

/// 検索条件
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilter {
    pub name: Option<String>,
    pub equal_value: Option<Vec<u8>>,
}

impl SearchFilter {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn to_bag(&self) -> PropertyBag {
        PropertyBag::builder()
            .with_opt(SEARCH_NAME, self.name.clone())
            .with_opt(SEARCH_EQUAL_VALUE, self.equal_value.clone())
            .build()
    }
}

/// レジスタコンテキストの型付きビュー
#[derive(Debug, Clone, PartialEq)]
pub struct RegistersContext {
    pub id: ContextId,
    pub parent_id: Option<ContextId>,
    pub process_id: Option<ContextId>,
    pub name: Option<String>,
    pub description: Option<String>,
    /// バイト数（グループなら 0）
    pub size: u64,
    pub readable: bool,
    pub read_once: bool,
    pub writeable: bool,
    pub write_once: bool,
    pub side_effects: bool,
    pub volatile: bool,
    pub float: bool,
    pub big_endian: bool,
    pub left_to_right: bool,
    pub first_bit: u32,
    /// ビットフィールドが親レジスタのどのビットを占めるか
    pub bits: Vec<u32>,
    pub values: Vec<NamedValue>,
    pub memory_address: Option<u64>,
    pub memory_context: Option<ContextId>,
    pub can_search: Vec<String>,
    pub role: Option<RegisterRole>,
    pub offset: Option<u64>,
    pub properties: PropertyBag,
}

impl RegistersContext {
    pub fn from_bag(bag: PropertyBag) -> Result<Self, DecodeError> {
        let bits = bag
            .get_list(PROP_BITS)?
            .unwrap_or_default()
            .iter()
            .map(|item| {
                item.as_int()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| DecodeError::PropertyType {
                        key: PROP_BITS.to_string(),
                        expected: "list of bit numbers",
                        found: item.kind(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let values = bag
            .get_list(PROP_VALUES)?
            .unwrap_or_default()
            .iter()
            .map(|item| match item {
                Value::Bag(v) => NamedValue::from_bag(v),
                other => Err(DecodeError::PropertyType {
                    key: PROP_VALUES.to_string(),
                    expected: "list of property bags",
                    found: other.kind(),
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            id: ContextId::from(bag.require_str(PROP_ID)?),
            parent_id: opt_id(&bag, PROP_PARENT_ID)?,
            process_id: opt_id(&bag, PROP_PROCESS_ID)?,
            name: bag.get_str(PROP_NAME)?.map(str::to_string),
            description: bag.get_str(PROP_DESCRIPTION)?.map(str::to_string),
            size: bag.get_u64(PROP_SIZE)?.unwrap_or(0),
            readable: bag.flag(PROP_READABLE)?,
            read_once: bag.flag(PROP_READ_ONCE)?,
            writeable: bag.flag(PROP_WRITEABLE)?,
            write_once: bag.flag(PROP_WRITE_ONCE)?,
            side_effects: bag.flag(PROP_SIDE_EFFECTS)?,
            volatile: bag.flag(PROP_VOLATILE)?,
            float: bag.flag(PROP_FLOAT)?,
            big_endian: bag.flag(PROP_BIG_ENDIAN)?,
            left_to_right: bag.flag(PROP_LEFT_TO_RIGHT)?,
            first_bit: bag.get_u32(PROP_FIRST_BIT)?.unwrap_or(0),
            bits,
            values,
            memory_address: bag.get_u64(PROP_MEMORY_ADDRESS)?,
            memory_context: opt_id(&bag, PROP_MEMORY_CONTEXT)?,
            can_search: bag.get_str_list(PROP_CAN_SEARCH)?.unwrap_or_default(),
            role: bag.get_str(PROP_ROLE)?.map(RegisterRole::parse),
            offset: bag.get_u64(PROP_OFFSET)?,
            properties: bag,
        })
    }

    /// 値全体を指す位置
    pub fn location(&self) -> Location {
        Location::new(self.id.clone(), 0, self.size)
    }
}

impl Context for RegistersContext {
    fn id(&self) -> &ContextId {
        &self.id
    }

    fn parent_id(&self) -> Option<&ContextId> {
        self.parent_id.as_ref()
    }

    fn owner_id(&self) -> Option<&ContextId> {
        self.process_id.as_ref()
    }

    fn properties(&self) -> &PropertyBag {
        &self.properties
    }

    fn update_policy(&self) -> UpdatePolicy {
        UpdatePolicy::OnExecutionStateChange
    }
}

/// Registers サービスの操作
pub trait Registers {
    fn get_context(&self, id: &ContextId, done: Done<RegistersContext>) -> Token;

    /// `parent` が `None` の場合はトップレベルのコンテキスト
    fn get_children(&self, parent: Option<&ContextId>, done: Done<Vec<ContextId>>) -> Token;

    fn get(&self, id: &ContextId, done: Done<Vec<u8>>) -> Token;

    fn set(&self, id: &ContextId, value: &[u8], done: Done<()>) -> Result<Token, ArgumentError>;

    /// 複数の位置をまとめて読む
    fn getm(&self, locs: &[Location], done: Done<Vec<u8>>) -> Token;

    fn setm(&self, locs: &[Location], value: &[u8], done: Done<()>) -> Result<Token, ArgumentError>;

    /// 条件に合うコンテキストへのパス（ID の列）の一覧
    fn search(
        &self,
        id: &ContextId,
        filter: &SearchFilter,
        done: Done<Vec<Vec<ContextId>>>,
    ) -> Token;

    fn add_listener(&self, listener: Arc<dyn RegistersListener>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId) -> bool;
}

/// Registers サービスのイベント
pub trait RegistersListener: Send + Sync {
    /// レジスタ構成が変わった（全コンテキストの再取得が必要）
    fn context_changed(&self) {}

    fn register_changed(&self, _id: &ContextId) {}

    fn context_added(&self, _contexts: &[RegistersContext]) {}

    fn context_removed(&self, _ids: &[ContextId]) {}
}

fn decode_all(bags: Vec<PropertyBag>) -> Result<Vec<RegistersContext>, DecodeError> {
    bags.into_iter().map(RegistersContext::from_bag).collect()
}

struct Events(Arc<dyn RegistersListener>);

impl EventListener for Events {
    fn event(&self, name: &str, args: &[Value]) -> Result<(), ListenerError> {
        let mut reader = ReplyReader::new(args);
        match name {
            EVENT_CONTEXT_CHANGED => self.0.context_changed(),
            EVENT_REGISTER_CHANGED => self.0.register_changed(&reader.id()?),
            EVENT_CONTEXT_ADDED => self.0.context_added(&decode_all(reader.bags()?)?),
            EVENT_CONTEXT_REMOVED => self.0.context_removed(&reader.ids()?),
            other => debug!("{}: ignoring event {}", SERVICE, other),
        }
        Ok(())
    }
}

struct CacheEvents(Arc<ContextCache<RegistersContext>>);

impl EventListener for CacheEvents {
    fn event(&self, name: &str, args: &[Value]) -> Result<(), ListenerError> {
        let mut reader = ReplyReader::new(args);
        match name {
            EVENT_CONTEXT_CHANGED => {
                self.0.invalidate_all();
            }
            EVENT_REGISTER_CHANGED => {
                // 値の変化は実行状態の変化として扱う
                let id = reader.id()?;
                self.0.invalidate_for(&id, &StateChange::ExecutionState(None));
            }
            EVENT_CONTEXT_REMOVED => {
                self.0.invalidate_many(&reader.ids()?);
            }
            _ => {}
        }
        Ok(())
    }
}

/// チャネル越しの Registers サービス
#[derive(Clone)]
pub struct RegistersProxy {
    service: RemoteService,
    cache: Arc<ContextCache<RegistersContext>>,
    subscriptions: Arc<Subscriptions<dyn RegistersListener>>,
}

impl RegistersProxy {
    pub fn new(channel: Channel) -> Self {
        let service = RemoteService::new(channel, SERVICE);
        let cache = Arc::new(ContextCache::new());
        service.add_listener(Arc::new(CacheEvents(Arc::clone(&cache))));
        Self {
            service,
            cache,
            subscriptions: Arc::default(),
        }
    }

    pub fn cache(&self) -> &ContextCache<RegistersContext> {
        &self.cache
    }

    pub fn cancel(&self, token: Token) -> bool {
        self.service.cancel(token)
    }

    /// キャッシュ済みのコンテキストがあれば値の長さを検証する
    fn check_size(&self, id: &ContextId, actual: usize) -> Result<(), ArgumentError> {
        match self.cache.get(id) {
            Some(ctx) if ctx.size != actual as u64 => Err(ArgumentError::SizeMismatch {
                id: id.clone(),
                expected: ctx.size,
                actual,
            }),
            _ => Ok(()),
        }
    }
}

impl Registers for RegistersProxy {
    fn get_context(&self, id: &ContextId, done: Done<RegistersContext>) -> Token {
        let cache = Arc::clone(&self.cache);
        self.service.command(
            "getContext",
            vec![id.into()],
            move |r| {
                let ctx = RegistersContext::from_bag(r.bag()?)?;
                cache.insert(ctx.clone());
                Ok(ctx)
            },
            done,
        )
    }

    fn get_children(&self, parent: Option<&ContextId>, done: Done<Vec<ContextId>>) -> Token {
        self.service.command(
            "getChildren",
            vec![parent.map(ContextId::to_string).into()],
            |r| r.ids(),
            done,
        )
    }

    fn get(&self, id: &ContextId, done: Done<Vec<u8>>) -> Token {
        self.service.command("get", vec![id.into()], |r| r.bytes(), done)
    }

    fn set(&self, id: &ContextId, value: &[u8], done: Done<()>) -> Result<Token, ArgumentError> {
        self.check_size(id, value.len())?;
        Ok(self.service.command(
            "set",
            vec![id.into(), value.to_vec().into()],
            |_| Ok(()),
            done,
        ))
    }

    fn getm(&self, locs: &[Location], done: Done<Vec<u8>>) -> Token {
        self.service.command("getm", vec![locations(locs)], |r| r.bytes(), done)
    }

    fn setm(&self, locs: &[Location], value: &[u8], done: Done<()>) -> Result<Token, ArgumentError> {
        let total: u64 = locs.iter().map(|l| l.size).sum();
        if total != value.len() as u64 {
            return Err(ArgumentError::SizeMismatch {
                id: locs.first().map(|l| l.id.clone()).unwrap_or_else(|| ContextId::from("")),
                expected: total,
                actual: value.len(),
            });
        }
        Ok(self.service.command(
            "setm",
            vec![locations(locs), value.to_vec().into()],
            |_| Ok(()),
            done,
        ))
    }

    fn search(
        &self,
        id: &ContextId,
        filter: &SearchFilter,
        done: Done<Vec<Vec<ContextId>>>,
    ) -> Token {
        self.service.command(
            "search",
            vec![id.into(), filter.to_bag().into()],
            |r| {
                let position = r.position();
                r.list()?
                    .iter()
                    .map(|path| {
                        ReplyReader::new(std::slice::from_ref(path))
                            .ids()
                            .map_err(|_| DecodeError::ArgumentType {
                                index: position,
                                expected: "list of ID paths",
                                found: path.kind(),
                            })
                    })
                    .collect()
            },
            done,
        )
    }

    fn add_listener(&self, listener: Arc<dyn RegistersListener>) -> ListenerId {
        self.subscriptions.add(&self.service, listener, |l| {
            Arc::new(Events(l)) as Arc<dyn EventListener>
        })
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.subscriptions.remove(&self.service, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pc_bag() -> PropertyBag {
        PropertyBag::builder()
            .with(PROP_ID, "R15")
            .with(PROP_PARENT_ID, "G0")
            .with(PROP_PROCESS_ID, "P1")
            .with(PROP_NAME, "pc")
            .with(PROP_SIZE, 4)
            .with(PROP_READABLE, true)
            .with(PROP_ROLE, "PC")
            .with(PROP_BITS, Value::list([0, 1, 2]))
            .with(
                PROP_VALUES,
                Value::list([PropertyBag::builder()
                    .with(VALUE_VALUE, vec![1u8])
                    .with(VALUE_NAME, "ON")
                    .build()]),
            )
            .build()
    }

    #[test]
    fn test_context_from_bag() {
        let ctx = RegistersContext::from_bag(pc_bag()).unwrap();
        assert_eq!(ctx.id, "R15");
        assert_eq!(ctx.parent_id(), Some(&ContextId::from("G0")));
        assert_eq!(ctx.owner_id(), Some(&ContextId::from("P1")));
        assert_eq!(ctx.size, 4);
        assert!(ctx.readable);
        assert!(!ctx.writeable);
        assert_eq!(ctx.role, Some(RegisterRole::Pc));
        assert_eq!(ctx.bits, vec![0, 1, 2]);
        assert_eq!(ctx.values[0].name.as_deref(), Some("ON"));
        assert_eq!(ctx.values[0].value, vec![1]);
        assert_eq!(ctx.location(), Location::new("R15", 0, 4));
    }

    #[test]
    fn test_unknown_role_is_kept() {
        let bag = PropertyBag::builder().with(PROP_ID, "R0").with(PROP_ROLE, "LR").build();
        let ctx = RegistersContext::from_bag(bag).unwrap();
        assert_eq!(ctx.role, Some(RegisterRole::Other("LR".into())));
        assert_eq!(ctx.role.unwrap().to_string(), "LR");
    }

    #[test]
    fn test_location_wire_form() {
        let loc = Location::new("R1", 2, 2);
        assert_eq!(
            Value::from(&loc),
            Value::List(vec!["R1".into(), 2.into(), 2.into()])
        );
    }

    #[test]
    fn test_search_filter_bag() {
        let bag = SearchFilter::by_name("sp").to_bag();
        assert_eq!(bag.get_str(SEARCH_NAME).unwrap(), Some("sp"));
        assert!(!bag.contains_key(SEARCH_EQUAL_VALUE));
    }
}
