//! 評価エラー

use crate::opcode::Opcode;

/// メモリ・レジスタアクセスの失敗
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    #[error("cannot read {size} bytes of memory at 0x{addr:x}")]
    Memory { addr: u64, size: usize },
    #[error("register {0} is not available")]
    Register(String),
    #[error("{0}")]
    Other(String),
}

/// 評価エラーの種類
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvaluationErrorKind {
    #[error("stack underflow: needs {needed} values, stack has {depth}")]
    StackUnderflow { needed: usize, depth: usize },
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("unknown opcode {0}")]
    UnknownOpcode(i128),
    #[error("malformed command: {0}")]
    MalformedCommand(String),
    #[error("arithmetic fault: {0}")]
    Arithmetic(&'static str),
    #[error("argument {index} is not supplied ({count} available)")]
    MissingArgument { index: usize, count: usize },
    #[error("frame base is not available")]
    NoFrameBase,
    #[error("value of {0} bytes is too wide")]
    TooWide(usize),
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error("DWARF expression: {0}")]
    Dwarf(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("expression has no result")]
    EmptyResult,
}

/// 位置式の評価エラー
///
/// `index` は失敗したコマンドの位置です。結果の取り出しで失敗した場合は
/// コマンド数と同じ値になります。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("command {index}{}: {kind}", describe(.opcode))]
pub struct EvaluationError {
    pub index: usize,
    pub opcode: Option<Opcode>,
    pub kind: EvaluationErrorKind,
}

fn describe(opcode: &Option<Opcode>) -> String {
    match opcode {
        Some(op) => format!(" ({})", op),
        None => String::new(),
    }
}

impl EvaluationError {
    pub fn new(index: usize, opcode: Option<Opcode>, kind: EvaluationErrorKind) -> Self {
        Self {
            index,
            opcode,
            kind,
        }
    }
}

pub type Result<T> = std::result::Result<T, EvaluationError>;
