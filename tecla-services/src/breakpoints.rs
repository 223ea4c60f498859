//! Breakpoints サービス
//!
//! ブレークポイントはクライアント側で ID を決めてエージェントに登録します。
//! エージェントは各ブレークポイントを実行中のコンテキストへ展開し、
//! その結果をステータス（インスタンスの一覧）として報告します。

use crate::context::{id_list, opt_id, Context, ContextCache, ContextId, UpdatePolicy};
use crate::error::ArgumentError;
use crate::facade::{Done, RemoteService, ReplyReader, Subscriptions};
use std::ops::BitOr;
use std::sync::Arc;
use tecla_protocol::{
    Channel, DecodeError, EventListener, ListenerError, ListenerId, PropertyBag, Token, Value,
};
use tracing::debug;

pub const SERVICE: &str = "Breakpoints";

pub const PROP_ID: &str = "ID";
pub const PROP_ENABLED: &str = "Enabled";
pub const PROP_TYPE: &str = "BreakpointType";
pub const PROP_CONTEXT_NAMES: &str = "ContextNames";
pub const PROP_CONTEXT_IDS: &str = "ContextIds";
pub const PROP_EXECUTABLE_PATHS: &str = "ExecPaths";
pub const PROP_CONTEXT_QUERY: &str = "ContextQuery";
pub const PROP_LOCATION: &str = "Location";
pub const PROP_SIZE: &str = "Size";
pub const PROP_ACCESS_MODE: &str = "AccessMode";
pub const PROP_FILE: &str = "File";
pub const PROP_LINE: &str = "Line";
pub const PROP_COLUMN: &str = "Column";
pub const PROP_PATTERN: &str = "MaskValue";
pub const PROP_MASK: &str = "Mask";
pub const PROP_STOP_GROUP: &str = "StopGroup";
pub const PROP_IGNORE_COUNT: &str = "IgnoreCount";
pub const PROP_TIME: &str = "Time";
pub const PROP_SCALE: &str = "TimeScale";
pub const PROP_UNITS: &str = "TimeUnits";
pub const PROP_CONDITION: &str = "Condition";
pub const PROP_TEMPORARY: &str = "Temporary";
pub const PROP_EVENT_TYPE: &str = "EventType";
pub const PROP_EVENT_ARGS: &str = "EventArgs";
pub const PROP_CLIENT_DATA: &str = "ClientData";

pub const STATUS_INSTANCES: &str = "Instances";
pub const STATUS_ERROR: &str = "Error";
pub const STATUS_FILE: &str = "File";
pub const STATUS_LINE: &str = "Line";
pub const STATUS_COLUMN: &str = "Column";

pub const INSTANCE_ERROR: &str = "Error";
pub const INSTANCE_CONTEXT: &str = "LocationContext";
pub const INSTANCE_ADDRESS: &str = "Address";
pub const INSTANCE_SIZE: &str = "Size";
pub const INSTANCE_TYPE: &str = "BreakpointType";
pub const INSTANCE_MEMORY_CONTEXT: &str = "MemoryContext";
pub const INSTANCE_HIT_COUNT: &str = "HitCount";

pub const CAPABILITY_CONTEXT_ID: &str = "ID";
pub const CAPABILITY_HAS_CHILDREN: &str = "HasChildren";
pub const CAPABILITY_BREAKPOINT_TYPE: &str = "BreakpointType";
pub const CAPABILITY_LOCATION: &str = "Location";
pub const CAPABILITY_CONDITION: &str = "Condition";
pub const CAPABILITY_FILE_LINE: &str = "FileLine";
pub const CAPABILITY_FILE_MAPPING: &str = "FileMapping";
pub const CAPABILITY_CONTEXT_IDS: &str = "ContextIds";
pub const CAPABILITY_CONTEXT_NAMES: &str = "ContextNames";
pub const CAPABILITY_CONTEXT_QUERY: &str = "ContextQuery";
pub const CAPABILITY_STOP_GROUP: &str = "StopGroup";
pub const CAPABILITY_TEMPORARY: &str = "Temporary";
pub const CAPABILITY_IGNORE_COUNT: &str = "IgnoreCount";
pub const CAPABILITY_ACCESS_MODE: &str = "AccessMode";
pub const CAPABILITY_CLIENT_DATA: &str = "ClientData";

pub const EVENT_STATUS: &str = "status";
pub const EVENT_CONTEXT_ADDED: &str = "contextAdded";
pub const EVENT_CONTEXT_CHANGED: &str = "contextChanged";
pub const EVENT_CONTEXT_REMOVED: &str = "contextRemoved";

/// 文字列で表される列挙型
macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident, $what:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            pub fn parse(text: &str) -> Option<Self> {
                match text {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }

            fn from_bag(bag: &PropertyBag, key: &str) -> Result<Option<Self>, DecodeError> {
                match bag.get_str(key)? {
                    None => Ok(None),
                    Some(text) => Self::parse(text).map(Some).ok_or_else(|| DecodeError::PropertyType {
                        key: key.to_string(),
                        expected: $what,
                        found: "string",
                    }),
                }
            }
        }

        impl From<$name> for Value {
            fn from(v: $name) -> Self {
                Value::from(v.as_str())
            }
        }
    };
}

wire_enum!(
    /// ブレークポイントの種類
    BreakpointType, "Software, Hardware or Auto" {
        Software => "Software",
        Hardware => "Hardware",
        Auto => "Auto",
    }
);

wire_enum!(
    /// `Time` プロパティの基準
    TimeScale, "Relative or Absolute" {
        Relative => "Relative",
        Absolute => "Absolute",
    }
);

wire_enum!(
    TimeUnits, "Nanoseconds, CycleCount or InstructionCount" {
        Nanoseconds => "Nanoseconds",
        CycleCount => "CycleCount",
        InstructionCount => "InstructionCount",
    }
);

/// データブレークポイントのアクセス種別（ビット集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AccessMode(u32);

impl AccessMode {
    pub const READ: Self = Self(0x01);
    pub const WRITE: Self = Self(0x02);
    pub const EXECUTE: Self = Self(0x04);
    pub const CHANGE: Self = Self(0x08);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for AccessMode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl From<AccessMode> for Value {
    fn from(mode: AccessMode) -> Self {
        Value::from(mode.0)
    }
}

fn id_vec(bag: &PropertyBag, key: &str) -> Result<Vec<ContextId>, DecodeError> {
    Ok(bag
        .get_str_list(key)?
        .unwrap_or_default()
        .into_iter()
        .map(ContextId::from)
        .collect())
}

fn opt_string(bag: &PropertyBag, key: &str) -> Result<Option<String>, DecodeError> {
    Ok(bag.get_str(key)?.map(str::to_string))
}

/// ブレークポイントの型付きビュー
#[derive(Debug, Clone, PartialEq)]
pub struct Breakpoint {
    pub id: ContextId,
    pub enabled: bool,
    pub breakpoint_type: Option<BreakpointType>,
    pub context_names: Vec<String>,
    pub context_ids: Vec<ContextId>,
    pub exec_paths: Vec<String>,
    pub context_query: Option<String>,
    /// アドレスを求める式
    pub location: Option<String>,
    pub size: Option<u64>,
    pub access_mode: Option<AccessMode>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub mask_value: Option<u64>,
    pub mask: Option<u64>,
    pub stop_group: Vec<ContextId>,
    pub ignore_count: Option<u64>,
    pub time: Option<u64>,
    pub time_scale: Option<TimeScale>,
    pub time_units: Option<TimeUnits>,
    pub condition: Option<String>,
    pub temporary: bool,
    pub event_type: Option<String>,
    pub event_args: Option<Value>,
    pub client_data: Option<Value>,
    pub properties: PropertyBag,
}

impl Breakpoint {
    /// 新しいブレークポイントのプロパティを組み立てる
    pub fn bag(id: impl Into<String>) -> tecla_protocol::PropertyBagBuilder {
        PropertyBag::builder().with(PROP_ID, id.into())
    }

    pub fn from_bag(bag: PropertyBag) -> Result<Self, DecodeError> {
        Ok(Self {
            id: ContextId::from(bag.require_str(PROP_ID)?),
            enabled: bag.flag(PROP_ENABLED)?,
            breakpoint_type: BreakpointType::from_bag(&bag, PROP_TYPE)?,
            context_names: bag.get_str_list(PROP_CONTEXT_NAMES)?.unwrap_or_default(),
            context_ids: id_vec(&bag, PROP_CONTEXT_IDS)?,
            exec_paths: bag.get_str_list(PROP_EXECUTABLE_PATHS)?.unwrap_or_default(),
            context_query: opt_string(&bag, PROP_CONTEXT_QUERY)?,
            location: opt_string(&bag, PROP_LOCATION)?,
            size: bag.get_u64(PROP_SIZE)?,
            access_mode: bag.get_u32(PROP_ACCESS_MODE)?.map(AccessMode::from_bits),
            file: opt_string(&bag, PROP_FILE)?,
            line: bag.get_u32(PROP_LINE)?,
            column: bag.get_u32(PROP_COLUMN)?,
            mask_value: bag.get_u64(PROP_PATTERN)?,
            mask: bag.get_u64(PROP_MASK)?,
            stop_group: id_vec(&bag, PROP_STOP_GROUP)?,
            ignore_count: bag.get_u64(PROP_IGNORE_COUNT)?,
            time: bag.get_u64(PROP_TIME)?,
            time_scale: TimeScale::from_bag(&bag, PROP_SCALE)?,
            time_units: TimeUnits::from_bag(&bag, PROP_UNITS)?,
            condition: opt_string(&bag, PROP_CONDITION)?,
            temporary: bag.flag(PROP_TEMPORARY)?,
            event_type: opt_string(&bag, PROP_EVENT_TYPE)?,
            event_args: bag.get(PROP_EVENT_ARGS).filter(|v| !v.is_null()).cloned(),
            client_data: bag.get(PROP_CLIENT_DATA).filter(|v| !v.is_null()).cloned(),
            properties: bag,
        })
    }
}

impl Context for Breakpoint {
    fn id(&self) -> &ContextId {
        &self.id
    }

    fn properties(&self) -> &PropertyBag {
        &self.properties
    }

    /// 展開先のアドレスはモジュールのロードで変わる
    fn update_policy(&self) -> UpdatePolicy {
        UpdatePolicy::OnMemoryMapChange
    }
}

/// 一つのコンテキストに展開されたブレークポイント
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BreakpointInstance {
    pub error: Option<String>,
    pub location_context: Option<ContextId>,
    pub address: Option<u64>,
    pub size: Option<u64>,
    pub breakpoint_type: Option<BreakpointType>,
    pub memory_context: Option<ContextId>,
    pub hit_count: Option<u64>,
}

impl BreakpointInstance {
    pub fn from_bag(bag: &PropertyBag) -> Result<Self, DecodeError> {
        Ok(Self {
            error: opt_string(bag, INSTANCE_ERROR)?,
            location_context: opt_id(bag, INSTANCE_CONTEXT)?,
            address: bag.get_u64(INSTANCE_ADDRESS)?,
            size: bag.get_u64(INSTANCE_SIZE)?,
            breakpoint_type: BreakpointType::from_bag(bag, INSTANCE_TYPE)?,
            memory_context: opt_id(bag, INSTANCE_MEMORY_CONTEXT)?,
            hit_count: bag.get_u64(INSTANCE_HIT_COUNT)?,
        })
    }
}

/// ブレークポイントのステータス
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BreakpointStatus {
    pub instances: Vec<BreakpointInstance>,
    /// ブレークポイント全体が設定できなかった理由
    pub error: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl BreakpointStatus {
    pub fn from_bag(bag: &PropertyBag) -> Result<Self, DecodeError> {
        let instances = bag
            .get_list(STATUS_INSTANCES)?
            .unwrap_or_default()
            .iter()
            .map(|item| match item {
                Value::Bag(instance) => BreakpointInstance::from_bag(instance),
                other => Err(DecodeError::PropertyType {
                    key: STATUS_INSTANCES.to_string(),
                    expected: "list of property bags",
                    found: other.kind(),
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            instances,
            error: opt_string(bag, STATUS_ERROR)?,
            file: opt_string(bag, STATUS_FILE)?,
            line: bag.get_u32(STATUS_LINE)?,
            column: bag.get_u32(STATUS_COLUMN)?,
        })
    }

    /// 一つ以上のコンテキストに設定されているか
    pub fn is_planted(&self) -> bool {
        self.instances.iter().any(|i| i.error.is_none())
    }
}

/// エージェントがサポートするブレークポイントのプロパティ
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Capabilities {
    pub context: Option<ContextId>,
    pub has_children: bool,
    pub breakpoint_type: bool,
    pub location: bool,
    pub condition: bool,
    pub file_line: bool,
    pub file_mapping: bool,
    pub context_ids: bool,
    pub context_names: bool,
    pub context_query: bool,
    pub stop_group: bool,
    pub temporary: bool,
    pub ignore_count: bool,
    pub access_mode: AccessMode,
    pub client_data: bool,
    pub properties: PropertyBag,
}

impl Capabilities {
    pub fn from_bag(bag: PropertyBag) -> Result<Self, DecodeError> {
        Ok(Self {
            context: opt_id(&bag, CAPABILITY_CONTEXT_ID)?,
            has_children: bag.flag(CAPABILITY_HAS_CHILDREN)?,
            breakpoint_type: bag.flag(CAPABILITY_BREAKPOINT_TYPE)?,
            location: bag.flag(CAPABILITY_LOCATION)?,
            condition: bag.flag(CAPABILITY_CONDITION)?,
            file_line: bag.flag(CAPABILITY_FILE_LINE)?,
            file_mapping: bag.flag(CAPABILITY_FILE_MAPPING)?,
            context_ids: bag.flag(CAPABILITY_CONTEXT_IDS)?,
            context_names: bag.flag(CAPABILITY_CONTEXT_NAMES)?,
            context_query: bag.flag(CAPABILITY_CONTEXT_QUERY)?,
            stop_group: bag.flag(CAPABILITY_STOP_GROUP)?,
            temporary: bag.flag(CAPABILITY_TEMPORARY)?,
            ignore_count: bag.flag(CAPABILITY_IGNORE_COUNT)?,
            access_mode: AccessMode::from_bits(bag.get_u32(CAPABILITY_ACCESS_MODE)?.unwrap_or(0)),
            client_data: bag.flag(CAPABILITY_CLIENT_DATA)?,
            properties: bag,
        })
    }
}

/// コマンド送信前にブレークポイントのプロパティを検証する
fn validate(bp: &PropertyBag) -> Result<ContextId, ArgumentError> {
    match bp.get(PROP_ID) {
        Some(Value::Str(id)) => Ok(ContextId::from(id.as_str())),
        None | Some(Value::Null) => Err(ArgumentError::MissingProperty(PROP_ID)),
        Some(_) => Err(ArgumentError::InvalidProperty {
            key: PROP_ID,
            expected: "a string",
        }),
    }
}

/// Breakpoints サービスの操作
pub trait Breakpoints {
    /// エージェント側のブレークポイント一覧を丸ごと置き換える
    fn set(&self, bps: &[PropertyBag], done: Done<()>) -> Result<Token, ArgumentError>;

    fn add(&self, bp: &PropertyBag, done: Done<()>) -> Result<Token, ArgumentError>;

    fn change(&self, bp: &PropertyBag, done: Done<()>) -> Result<Token, ArgumentError>;

    fn enable(&self, ids: &[ContextId], done: Done<()>) -> Token;

    fn disable(&self, ids: &[ContextId], done: Done<()>) -> Token;

    fn remove(&self, ids: &[ContextId], done: Done<()>) -> Token;

    fn get_ids(&self, done: Done<Vec<ContextId>>) -> Token;

    fn get_properties(&self, id: &ContextId, done: Done<Breakpoint>) -> Token;

    fn get_status(&self, id: &ContextId, done: Done<BreakpointStatus>) -> Token;

    /// `id` が `None` の場合はエージェント全体のケイパビリティ
    fn get_capabilities(&self, id: Option<&ContextId>, done: Done<Capabilities>) -> Token;

    fn add_listener(&self, listener: Arc<dyn BreakpointsListener>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId) -> bool;
}

/// Breakpoints サービスのイベント
pub trait BreakpointsListener: Send + Sync {
    fn breakpoint_status_changed(&self, _id: &ContextId, _status: &BreakpointStatus) {}

    fn context_added(&self, _bps: &[Breakpoint]) {}

    fn context_changed(&self, _bps: &[Breakpoint]) {}

    fn context_removed(&self, _ids: &[ContextId]) {}
}

fn decode_all(bags: Vec<PropertyBag>) -> Result<Vec<Breakpoint>, DecodeError> {
    bags.into_iter().map(Breakpoint::from_bag).collect()
}

/// 型付きリスナーへのアダプタ
struct Events(Arc<dyn BreakpointsListener>);

impl EventListener for Events {
    fn event(&self, name: &str, args: &[Value]) -> Result<(), ListenerError> {
        let mut reader = ReplyReader::new(args);
        match name {
            EVENT_STATUS => {
                let id = reader.id()?;
                let status = BreakpointStatus::from_bag(&reader.bag()?)?;
                self.0.breakpoint_status_changed(&id, &status);
            }
            EVENT_CONTEXT_ADDED => self.0.context_added(&decode_all(reader.bags()?)?),
            EVENT_CONTEXT_CHANGED => self.0.context_changed(&decode_all(reader.bags()?)?),
            EVENT_CONTEXT_REMOVED => self.0.context_removed(&reader.ids()?),
            other => debug!("{}: ignoring event {}", SERVICE, other),
        }
        Ok(())
    }
}

/// イベントに名前が挙がったブレークポイントをキャッシュから外す
struct CacheEvents(Arc<ContextCache<Breakpoint>>);

impl EventListener for CacheEvents {
    fn event(&self, name: &str, args: &[Value]) -> Result<(), ListenerError> {
        let mut reader = ReplyReader::new(args);
        let ids = match name {
            EVENT_CONTEXT_CHANGED => reader
                .bags()?
                .iter()
                .map(|bag| bag.require_str(PROP_ID).map(ContextId::from))
                .collect::<Result<Vec<_>, _>>()?,
            EVENT_CONTEXT_REMOVED => reader.ids()?,
            _ => return Ok(()),
        };
        self.0.invalidate_many(&ids);
        Ok(())
    }
}

/// チャネル越しの Breakpoints サービス
#[derive(Clone)]
pub struct BreakpointsProxy {
    service: RemoteService,
    cache: Arc<ContextCache<Breakpoint>>,
    subscriptions: Arc<Subscriptions<dyn BreakpointsListener>>,
}

impl BreakpointsProxy {
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

    pub fn cache(&self) -> &ContextCache<Breakpoint> {
        &self.cache
    }

    pub fn cancel(&self, token: Token) -> bool {
        self.service.cancel(token)
    }

    /// 成功したら `ids` をキャッシュから外すコマンドを送る
    fn invalidating(&self, verb: &str, args: Vec<Value>, ids: Vec<ContextId>, done: Done<()>) -> Token {
        let cache = Arc::clone(&self.cache);
        self.service.command(
            verb,
            args,
            |_| Ok(()),
            Box::new(move |token, result| {
                if result.is_ok() {
                    cache.invalidate_many(&ids);
                }
                done(token, result)
            }),
        )
    }
}

impl Breakpoints for BreakpointsProxy {
    fn set(&self, bps: &[PropertyBag], done: Done<()>) -> Result<Token, ArgumentError> {
        for bp in bps {
            validate(bp)?;
        }
        let cache = Arc::clone(&self.cache);
        let args = vec![Value::list(bps.iter().cloned())];
        Ok(self.service.command(
            "set",
            args,
            |_| Ok(()),
            Box::new(move |token, result| {
                if result.is_ok() {
                    cache.invalidate_all();
                }
                done(token, result)
            }),
        ))
    }

    fn add(&self, bp: &PropertyBag, done: Done<()>) -> Result<Token, ArgumentError> {
        let id = validate(bp)?;
        Ok(self.invalidating("add", vec![bp.clone().into()], vec![id], done))
    }

    fn change(&self, bp: &PropertyBag, done: Done<()>) -> Result<Token, ArgumentError> {
        let id = validate(bp)?;
        Ok(self.invalidating("change", vec![bp.clone().into()], vec![id], done))
    }

    fn enable(&self, ids: &[ContextId], done: Done<()>) -> Token {
        self.invalidating("enable", vec![id_list(ids)], ids.to_vec(), done)
    }

    fn disable(&self, ids: &[ContextId], done: Done<()>) -> Token {
        self.invalidating("disable", vec![id_list(ids)], ids.to_vec(), done)
    }

    fn remove(&self, ids: &[ContextId], done: Done<()>) -> Token {
        self.invalidating("remove", vec![id_list(ids)], ids.to_vec(), done)
    }

    fn get_ids(&self, done: Done<Vec<ContextId>>) -> Token {
        self.service.command("getIDs", Vec::new(), |r| r.ids(), done)
    }

    fn get_properties(&self, id: &ContextId, done: Done<Breakpoint>) -> Token {
        let cache = Arc::clone(&self.cache);
        let requested = id.clone();
        self.service.command(
            "getProperties",
            vec![id.into()],
            move |r| {
                let mut bag = r.bag()?;
                if !bag.contains_key(PROP_ID) {
                    bag = bag.to_builder().with(PROP_ID, requested).build();
                }
                let bp = Breakpoint::from_bag(bag)?;
                cache.insert(bp.clone());
                Ok(bp)
            },
            done,
        )
    }

    fn get_status(&self, id: &ContextId, done: Done<BreakpointStatus>) -> Token {
        self.service.command(
            "getStatus",
            vec![id.into()],
            |r| BreakpointStatus::from_bag(&r.bag()?),
            done,
        )
    }

    fn get_capabilities(&self, id: Option<&ContextId>, done: Done<Capabilities>) -> Token {
        self.service.command(
            "getCapabilities",
            vec![id.map(ContextId::to_string).into()],
            |r| Capabilities::from_bag(r.bag()?),
            done,
        )
    }

    fn add_listener(&self, listener: Arc<dyn BreakpointsListener>) -> ListenerId {
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
    use assert_matches::assert_matches;

    #[test]
    fn test_breakpoint_from_bag() {
        let bag = Breakpoint::bag("bp1")
            .with(PROP_ENABLED, true)
            .with(PROP_TYPE, BreakpointType::Hardware)
            .with(PROP_ACCESS_MODE, AccessMode::READ | AccessMode::WRITE)
            .with(PROP_CONTEXT_IDS, Value::list(["P1", "P2"]))
            .with(PROP_LINE, 42)
            .with(PROP_SCALE, TimeScale::Absolute)
            .build();
        let bp = Breakpoint::from_bag(bag).unwrap();

        assert_eq!(bp.id, "bp1");
        assert!(bp.enabled);
        assert!(!bp.temporary);
        assert_eq!(bp.breakpoint_type, Some(BreakpointType::Hardware));
        let mode = bp.access_mode.unwrap();
        assert!(mode.contains(AccessMode::WRITE));
        assert!(!mode.contains(AccessMode::EXECUTE));
        assert_eq!(bp.context_ids, vec![ContextId::from("P1"), ContextId::from("P2")]);
        assert_eq!(bp.line, Some(42));
        assert_eq!(bp.time_scale, Some(TimeScale::Absolute));
    }

    #[test]
    fn test_unknown_breakpoint_type() {
        let bag = Breakpoint::bag("bp1").with(PROP_TYPE, "Magic").build();
        assert_matches!(
            Breakpoint::from_bag(bag),
            Err(DecodeError::PropertyType { expected: "Software, Hardware or Auto", .. })
        );
    }

    #[test]
    fn test_status_instances() {
        let instance = PropertyBag::builder()
            .with(INSTANCE_CONTEXT, "P1")
            .with(INSTANCE_ADDRESS, 0x401000u64)
            .with(INSTANCE_HIT_COUNT, 3)
            .build();
        let failed = PropertyBag::builder().with(INSTANCE_ERROR, "no code at line").build();
        let bag = PropertyBag::builder()
            .with(STATUS_INSTANCES, Value::list([instance, failed]))
            .build();

        let status = BreakpointStatus::from_bag(&bag).unwrap();
        assert_eq!(status.instances.len(), 2);
        assert_eq!(status.instances[0].address, Some(0x401000));
        assert_eq!(status.instances[0].location_context, Some("P1".into()));
        assert!(status.is_planted());
        assert!(!BreakpointStatus::default().is_planted());
    }

    #[test]
    fn test_validate_requires_string_id() {
        assert_eq!(
            validate(&PropertyBag::new()),
            Err(ArgumentError::MissingProperty(PROP_ID))
        );
        let numeric = PropertyBag::builder().with(PROP_ID, 7).build();
        assert_matches!(validate(&numeric), Err(ArgumentError::InvalidProperty { .. }));
    }

    #[test]
    fn test_capabilities() {
        let bag = PropertyBag::builder()
            .with(CAPABILITY_CONDITION, true)
            .with(CAPABILITY_ACCESS_MODE, 0x3)
            .build();
        let caps = Capabilities::from_bag(bag).unwrap();
        assert!(caps.condition);
        assert!(!caps.temporary);
        assert!(caps.access_mode.contains(AccessMode::READ | AccessMode::WRITE));
    }
}
