//! Symbols サービス
//!
//! シンボルの検索とプロパティ取得に加え、スタックトレース用のフレーム情報と
//! シンボルの位置情報を扱います。フレーム情報・位置情報に含まれる位置式は
//! `tecla_lvm` で評価します。

use crate::context::{opt_id, Context, ContextCache, ContextId, StateChange, UpdatePolicy};
use crate::error::CacheInconsistency;
use crate::facade::{Done, RemoteService, ReplyReader};
use std::collections::BTreeMap;
use std::ops::BitOr;
use std::sync::Arc;
use tecla_lvm::{EvalContext, EvaluationError, EvaluationErrorKind, Located, Program};
use tecla_protocol::{Channel, DecodeError, PropertyBag, Token, Value};

pub const SERVICE: &str = "Symbols";

pub const PROP_ID: &str = "ID";
pub const PROP_OWNER_ID: &str = "OwnerID";
pub const PROP_UPDATE_POLICY: &str = "UpdatePolicy";
pub const PROP_NAME: &str = "Name";
pub const PROP_SYMBOL_CLASS: &str = "Class";
pub const PROP_TYPE_CLASS: &str = "TypeClass";
pub const PROP_TYPE_ID: &str = "TypeID";
pub const PROP_BASE_TYPE_ID: &str = "BaseTypeID";
pub const PROP_INDEX_TYPE_ID: &str = "IndexTypeID";
pub const PROP_SIZE: &str = "Size";
pub const PROP_LENGTH: &str = "Length";
pub const PROP_LOWER_BOUND: &str = "LowerBound";
pub const PROP_UPPER_BOUND: &str = "UpperBound";
pub const PROP_OFFSET: &str = "Offset";
pub const PROP_ADDRESS: &str = "Address";
pub const PROP_VALUE: &str = "Value";
pub const PROP_BIG_ENDIAN: &str = "BigEndian";
pub const PROP_REGISTER: &str = "Register";
pub const PROP_FLAGS: &str = "Flags";
pub const PROP_CONTAINER_ID: &str = "ContainerID";

pub const LOC_CODE_ADDR: &str = "CodeAddr";
pub const LOC_CODE_SIZE: &str = "CodeSize";
pub const LOC_ARG_CNT: &str = "ArgCnt";
pub const LOC_VALUE_CMDS: &str = "ValueCmds";
pub const LOC_LENGTH_CMDS: &str = "LengthCmds";

/// シンボルの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SymbolClass {
    #[default]
    Unknown,
    /// 定数
    Value,
    /// 変数
    Reference,
    Function,
    Type,
    CompUnit,
    Block,
    Namespace,
}

impl SymbolClass {
    pub fn from_code(code: i128) -> Result<Self, DecodeError> {
        Ok(match code {
            0 => Self::Unknown,
            1 => Self::Value,
            2 => Self::Reference,
            3 => Self::Function,
            4 => Self::Type,
            5 => Self::CompUnit,
            6 => Self::Block,
            7 => Self::Namespace,
            value => {
                return Err(DecodeError::UnknownEnumValue {
                    what: "symbol class",
                    value,
                })
            }
        })
    }
}

/// 型の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TypeClass {
    #[default]
    Unknown,
    /// 符号なし整数
    Cardinal,
    Integer,
    /// 浮動小数点数
    Real,
    Pointer,
    Array,
    /// 構造体・共用体・クラス
    Composite,
    Enumeration,
    Function,
    MemberPtr,
}

impl TypeClass {
    pub fn from_code(code: i128) -> Result<Self, DecodeError> {
        Ok(match code {
            0 => Self::Unknown,
            1 => Self::Cardinal,
            2 => Self::Integer,
            3 => Self::Real,
            4 => Self::Pointer,
            5 => Self::Array,
            6 => Self::Composite,
            7 => Self::Enumeration,
            8 => Self::Function,
            9 => Self::MemberPtr,
            value => {
                return Err(DecodeError::UnknownEnumValue {
                    what: "type class",
                    value,
                })
            }
        })
    }
}

/// シンボルフラグ（ビット集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SymbolFlags(u32);

impl SymbolFlags {
    pub const PARAMETER: Self = Self(0x0000001);
    pub const TYPEDEF: Self = Self(0x0000002);
    pub const CONST_TYPE: Self = Self(0x0000004);
    pub const PACKET_TYPE: Self = Self(0x0000008);
    pub const SUBRANGE_TYPE: Self = Self(0x0000010);
    pub const VOLATILE_TYPE: Self = Self(0x0000020);
    pub const RESTRICT_TYPE: Self = Self(0x0000040);
    pub const UNION_TYPE: Self = Self(0x0000080);
    pub const CLASS_TYPE: Self = Self(0x0000100);
    pub const INTERFACE_TYPE: Self = Self(0x0000200);
    pub const SHARED_TYPE: Self = Self(0x0000400);
    pub const REFERENCE: Self = Self(0x0000800);
    pub const BIG_ENDIAN: Self = Self(0x0001000);
    pub const LITTLE_ENDIAN: Self = Self(0x0002000);
    pub const OPTIONAL: Self = Self(0x0004000);
    pub const EXTERNAL: Self = Self(0x0008000);
    pub const VARARG: Self = Self(0x0010000);
    pub const ARTIFICIAL: Self = Self(0x0020000);
    pub const TYPE_PARAMETER: Self = Self(0x0040000);
    pub const PRIVATE: Self = Self(0x0080000);
    pub const PROTECTED: Self = Self(0x0100000);
    pub const PUBLIC: Self = Self(0x0200000);
    pub const ENUM_TYPE: Self = Self(0x0400000);
    pub const STRUCT_TYPE: Self = Self(0x0800000);
    pub const STRING_TYPE: Self = Self(0x1000000);
    pub const INHERITANCE: Self = Self(0x2000000);
    pub const BOOL_TYPE: Self = Self(0x4000000);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SymbolFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// シンボルの型付きビュー
#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub id: ContextId,
    pub owner_id: Option<ContextId>,
    pub update_policy: UpdatePolicy,
    pub name: Option<String>,
    pub symbol_class: SymbolClass,
    pub type_class: TypeClass,
    pub type_id: Option<ContextId>,
    pub base_type_id: Option<ContextId>,
    pub index_type_id: Option<ContextId>,
    pub size: Option<u64>,
    pub length: Option<u64>,
    pub lower_bound: Option<i64>,
    pub upper_bound: Option<i64>,
    pub offset: Option<u64>,
    pub address: Option<u64>,
    /// 定数の値
    pub value: Option<Vec<u8>>,
    pub big_endian: bool,
    /// 値を保持しているレジスタ
    pub register: Option<ContextId>,
    pub flags: SymbolFlags,
    pub container_id: Option<ContextId>,
    pub properties: PropertyBag,
}

impl Symbol {
    pub fn from_bag(bag: PropertyBag) -> Result<Self, DecodeError> {
        let update_policy = match bag.get_int(PROP_UPDATE_POLICY)? {
            Some(code) => UpdatePolicy::from_code(code)?,
            None => UpdatePolicy::OnMemoryMapChange,
        };
        // 古いエージェントは Register を真偽値で送る
        let register = match bag.get(PROP_REGISTER) {
            Some(Value::Str(id)) => Some(ContextId::from(id.as_str())),
            None | Some(Value::Null) | Some(Value::Bool(_)) => None,
            Some(other) => {
                return Err(DecodeError::PropertyType {
                    key: PROP_REGISTER.to_string(),
                    expected: "string",
                    found: other.kind(),
                })
            }
        };
        Ok(Self {
            id: ContextId::from(bag.require_str(PROP_ID)?),
            owner_id: opt_id(&bag, PROP_OWNER_ID)?,
            update_policy,
            name: bag.get_str(PROP_NAME)?.map(str::to_string),
            symbol_class: SymbolClass::from_code(bag.get_int(PROP_SYMBOL_CLASS)?.unwrap_or(0))?,
            type_class: TypeClass::from_code(bag.get_int(PROP_TYPE_CLASS)?.unwrap_or(0))?,
            type_id: opt_id(&bag, PROP_TYPE_ID)?,
            base_type_id: opt_id(&bag, PROP_BASE_TYPE_ID)?,
            index_type_id: opt_id(&bag, PROP_INDEX_TYPE_ID)?,
            size: bag.get_u64(PROP_SIZE)?,
            length: bag.get_u64(PROP_LENGTH)?,
            lower_bound: bag.get_i64(PROP_LOWER_BOUND)?,
            upper_bound: bag.get_i64(PROP_UPPER_BOUND)?,
            offset: bag.get_u64(PROP_OFFSET)?,
            address: bag.get_u64(PROP_ADDRESS)?,
            value: bag.get_bytes(PROP_VALUE)?.map(<[u8]>::to_vec),
            big_endian: bag.flag(PROP_BIG_ENDIAN)?,
            register,
            flags: SymbolFlags::from_bits(bag.get_u32(PROP_FLAGS)?.unwrap_or(0)),
            container_id: opt_id(&bag, PROP_CONTAINER_ID)?,
            properties: bag,
        })
    }
}

impl Context for Symbol {
    fn id(&self) -> &ContextId {
        &self.id
    }

    fn parent_id(&self) -> Option<&ContextId> {
        self.container_id.as_ref()
    }

    fn owner_id(&self) -> Option<&ContextId> {
        self.owner_id.as_ref()
    }

    fn properties(&self) -> &PropertyBag {
        &self.properties
    }

    fn update_policy(&self) -> UpdatePolicy {
        self.update_policy
    }
}

fn invalid(key: &str, err: EvaluationError) -> DecodeError {
    DecodeError::InvalidProperty {
        key: key.to_string(),
        message: err.to_string(),
    }
}

fn program(value: Option<&Value>, key: &str) -> Result<Program, DecodeError> {
    match value {
        None => Ok(Program::default()),
        Some(value) => Program::from_value(value).map_err(|e| invalid(key, e)),
    }
}

/// 結果を数値として取り出す
fn as_number(program: &Program, located: Located) -> Result<u64, EvaluationError> {
    match located {
        Located::Memory(n) => Ok(n),
        _ => Err(EvaluationError::new(
            program.len(),
            None,
            EvaluationErrorKind::TypeMismatch {
                expected: "number",
                found: "location",
            },
        )),
    }
}

/// スタックトレース用のフレーム情報
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FrameInfo {
    /// 命令アドレス範囲の先頭
    pub address: u64,
    pub size: u64,
    /// フレームポインタを求める式
    pub fp_cmds: Program,
    /// レジスタID -> 呼び出し元のレジスタ値の格納場所を求める式
    pub reg_cmds: BTreeMap<ContextId, Program>,
}

impl FrameInfo {
    fn read(r: &mut ReplyReader<'_>) -> Result<Self, DecodeError> {
        let address = r.u64()?;
        let size = r.u64()?;
        let fp_cmds = program(Some(r.value()?), "fp_cmds")?;
        let reg_cmds = match r.opt_bag()? {
            None => BTreeMap::new(),
            Some(bag) => bag
                .iter()
                .map(|(id, cmds)| program(Some(cmds), id).map(|p| (ContextId::from(id), p)))
                .collect::<Result<BTreeMap<_, _>, _>>()?,
        };
        Ok(Self {
            address,
            size,
            fp_cmds,
            reg_cmds,
        })
    }

    /// 命令アドレスがこの範囲に含まれるか
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.address && addr - self.address < self.size
    }

    /// フレームポインタを計算する
    pub fn frame_pointer(&self, ctx: &EvalContext) -> Result<u64, EvaluationError> {
        let located = self.fp_cmds.evaluate(ctx)?;
        as_number(&self.fp_cmds, located)
    }

    /// レジスタの退避場所を計算する（式がなければ `None`）
    ///
    /// # Arguments
    /// * `id` - レジスタID
    /// * `ctx` - 評価コンテキスト（通常はフレームポインタをフレームベースに設定する）
    pub fn register_location(
        &self,
        id: &ContextId,
        ctx: &EvalContext,
    ) -> Result<Option<Located>, EvaluationError> {
        self.reg_cmds
            .get(id)
            .map(|cmds| cmds.evaluate(ctx))
            .transpose()
    }
}

/// シンボルの位置情報
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LocationInfo {
    pub code_addr: Option<u64>,
    pub code_size: Option<u64>,
    /// 位置式の評価に必要な引数の数
    pub arg_cnt: usize,
    pub value_cmds: Program,
    /// 動的配列の長さを求める式
    pub length_cmds: Option<Program>,
    pub properties: PropertyBag,
}

impl LocationInfo {
    pub fn from_bag(bag: PropertyBag) -> Result<Self, DecodeError> {
        let arg_cnt = match bag.get_u64(LOC_ARG_CNT)? {
            Some(n) => usize::try_from(n).map_err(|_| DecodeError::OutOfRange(n as i128))?,
            None => 0,
        };
        let length_cmds = match bag.get(LOC_LENGTH_CMDS) {
            None | Some(Value::Null) => None,
            Some(value) => Some(program(Some(value), LOC_LENGTH_CMDS)?),
        };
        Ok(Self {
            code_addr: bag.get_u64(LOC_CODE_ADDR)?,
            code_size: bag.get_u64(LOC_CODE_SIZE)?,
            arg_cnt,
            value_cmds: program(bag.get(LOC_VALUE_CMDS), LOC_VALUE_CMDS)?,
            length_cmds,
            properties: bag,
        })
    }

    fn check_args(&self, ctx: &EvalContext) -> Result<(), EvaluationError> {
        let count = ctx.args().len();
        if count < self.arg_cnt {
            return Err(EvaluationError::new(
                0,
                None,
                EvaluationErrorKind::MissingArgument {
                    index: self.arg_cnt - 1,
                    count,
                },
            ));
        }
        Ok(())
    }

    /// 値の格納場所を計算する
    pub fn value_location(&self, ctx: &EvalContext) -> Result<Located, EvaluationError> {
        self.check_args(ctx)?;
        self.value_cmds.evaluate(ctx)
    }

    /// 動的配列の長さを計算する（式がなければ `None`）
    pub fn length(&self, ctx: &EvalContext) -> Result<Option<u64>, EvaluationError> {
        let Some(cmds) = &self.length_cmds else {
            return Ok(None);
        };
        self.check_args(ctx)?;
        let located = cmds.evaluate(ctx)?;
        as_number(cmds, located).map(Some)
    }
}

/// 検索結果の ID リストを読む
///
/// 古いエージェントは `find` に単一の ID を返します。
fn found_ids(r: &mut ReplyReader<'_>) -> Result<Vec<ContextId>, DecodeError> {
    match r.value()? {
        Value::Str(id) => Ok(vec![ContextId::from(id.as_str())]),
        Value::Null => Ok(Vec::new()),
        other => ReplyReader::new(std::slice::from_ref(other)).ids().map_err(|_| {
            DecodeError::ArgumentType {
                index: r.position() - 1,
                expected: "symbol ID or list of symbol IDs",
                found: other.kind(),
            }
        }),
    }
}

/// Symbols サービスの操作
pub trait Symbols {
    fn get_context(&self, id: &ContextId, done: Done<Symbol>) -> Token;

    fn get_children(&self, parent: &ContextId, done: Done<Vec<ContextId>>) -> Token;

    /// 名前で最初のシンボルを探す
    ///
    /// # Arguments
    /// * `context` - 検索範囲（メモリ空間・プロセス・スレッド・スタックフレーム）
    /// * `ip` - 命令ポインタ（`context` がスタックフレームなら無視される）
    /// * `name` - シンボル名
    fn find(&self, context: &ContextId, ip: u64, name: &str, done: Done<Vec<ContextId>>) -> Token;

    fn find_by_name(
        &self,
        context: &ContextId,
        ip: u64,
        name: &str,
        done: Done<Vec<ContextId>>,
    ) -> Token;

    fn find_by_addr(&self, context: &ContextId, addr: u64, done: Done<Vec<ContextId>>) -> Token;

    /// `ip` の範囲で見つからなければ `scope` の中を探す
    fn find_in_scope(
        &self,
        context: &ContextId,
        ip: Option<u64>,
        scope: &ContextId,
        name: &str,
        done: Done<Vec<ContextId>>,
    ) -> Token;

    fn list(&self, context: &ContextId, done: Done<Vec<ContextId>>) -> Token;

    /// 配列型を作る（`length` が 0 ならポインタ型）
    fn get_array_type(&self, type_id: &ContextId, length: u64, done: Done<ContextId>) -> Token;

    fn find_frame_info(&self, context: &ContextId, addr: u64, done: Done<FrameInfo>) -> Token;

    fn get_location_info(&self, symbol: &ContextId, done: Done<LocationInfo>) -> Token;

    fn get_sym_file_info(&self, context: &ContextId, addr: u64, done: Done<PropertyBag>) -> Token;
}

/// チャネル越しの Symbols サービス
#[derive(Clone)]
pub struct SymbolsProxy {
    service: RemoteService,
    cache: Arc<ContextCache<Symbol>>,
}

impl SymbolsProxy {
    pub fn new(channel: Channel) -> Self {
        Self {
            service: RemoteService::new(channel, SERVICE),
            cache: Arc::new(ContextCache::new()),
        }
    }

    pub fn cache(&self) -> &ContextCache<Symbol> {
        &self.cache
    }

    pub fn cancel(&self, token: Token) -> bool {
        self.service.cancel(token)
    }

    /// 状態変化を理由に一つのシンボルを無効化する
    pub fn invalidate(&self, id: &ContextId, trigger: &StateChange) -> Option<CacheInconsistency> {
        self.cache.invalidate_for(id, trigger)
    }

    fn search(&self, verb: &str, args: Vec<Value>, done: Done<Vec<ContextId>>) -> Token {
        self.service.command(verb, args, |r| r.ids(), done)
    }
}

impl Symbols for SymbolsProxy {
    fn get_context(&self, id: &ContextId, done: Done<Symbol>) -> Token {
        let cache = Arc::clone(&self.cache);
        self.service.command(
            "getContext",
            vec![id.into()],
            move |r| {
                let symbol = Symbol::from_bag(r.bag()?)?;
                cache.insert(symbol.clone());
                Ok(symbol)
            },
            done,
        )
    }

    fn get_children(&self, parent: &ContextId, done: Done<Vec<ContextId>>) -> Token {
        self.search("getChildren", vec![parent.into()], done)
    }

    fn find(&self, context: &ContextId, ip: u64, name: &str, done: Done<Vec<ContextId>>) -> Token {
        self.service.command(
            "find",
            vec![context.into(), ip.into(), name.into()],
            found_ids,
            done,
        )
    }

    fn find_by_name(
        &self,
        context: &ContextId,
        ip: u64,
        name: &str,
        done: Done<Vec<ContextId>>,
    ) -> Token {
        self.search("findByName", vec![context.into(), ip.into(), name.into()], done)
    }

    fn find_by_addr(&self, context: &ContextId, addr: u64, done: Done<Vec<ContextId>>) -> Token {
        self.service.command(
            "findByAddr",
            vec![context.into(), addr.into()],
            found_ids,
            done,
        )
    }

    fn find_in_scope(
        &self,
        context: &ContextId,
        ip: Option<u64>,
        scope: &ContextId,
        name: &str,
        done: Done<Vec<ContextId>>,
    ) -> Token {
        self.search(
            "findInScope",
            vec![context.into(), ip.into(), scope.into(), name.into()],
            done,
        )
    }

    fn list(&self, context: &ContextId, done: Done<Vec<ContextId>>) -> Token {
        self.search("list", vec![context.into()], done)
    }

    fn get_array_type(&self, type_id: &ContextId, length: u64, done: Done<ContextId>) -> Token {
        self.service.command(
            "getArrayType",
            vec![type_id.into(), length.into()],
            |r| r.id(),
            done,
        )
    }

    fn find_frame_info(&self, context: &ContextId, addr: u64, done: Done<FrameInfo>) -> Token {
        self.service.command(
            "findFrameInfo",
            vec![context.into(), addr.into()],
            FrameInfo::read,
            done,
        )
    }

    fn get_location_info(&self, symbol: &ContextId, done: Done<LocationInfo>) -> Token {
        self.service.command(
            "getLocationInfo",
            vec![symbol.into()],
            |r| LocationInfo::from_bag(r.bag()?),
            done,
        )
    }

    fn get_sym_file_info(&self, context: &ContextId, addr: u64, done: Done<PropertyBag>) -> Token {
        self.service.command(
            "getSymFileInfo",
            vec![context.into(), addr.into()],
            |r| r.bag(),
            done,
        )
    }
}
