//! 位置式のコマンドとデコード
//!
//! ワイヤ上のコマンドは `[code, operands...]` のリストです。オペランドのない
//! コマンドは整数だけでも構いません。

use crate::error::{EvaluationError, EvaluationErrorKind};
use std::fmt;
use tecla_protocol::{PropertyBag, Value};

/// オペコード
///
/// 2 と 4 は廃止済みですが、古いエージェントのために元の意味でデコードします。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Number = 1,
    Register = 2,
    Fp = 3,
    Deref = 4,
    Add = 5,
    Sub = 6,
    Mul = 7,
    Div = 8,
    And = 9,
    Or = 10,
    Xor = 11,
    Neg = 12,
    Ge = 13,
    Gt = 14,
    Le = 15,
    Lt = 16,
    Shl = 17,
    Shr = 18,
    Arg = 19,
    Location = 20,
    Fcall = 21,
    WrReg = 22,
    WrMem = 23,
    Piece = 24,
}

impl Opcode {
    pub fn from_code(code: i128) -> Option<Self> {
        let op = match code {
            1 => Opcode::Number,
            2 => Opcode::Register,
            3 => Opcode::Fp,
            4 => Opcode::Deref,
            5 => Opcode::Add,
            6 => Opcode::Sub,
            7 => Opcode::Mul,
            8 => Opcode::Div,
            9 => Opcode::And,
            10 => Opcode::Or,
            11 => Opcode::Xor,
            12 => Opcode::Neg,
            13 => Opcode::Ge,
            14 => Opcode::Gt,
            15 => Opcode::Le,
            16 => Opcode::Lt,
            17 => Opcode::Shl,
            18 => Opcode::Shr,
            19 => Opcode::Arg,
            20 => Opcode::Location,
            21 => Opcode::Fcall,
            22 => Opcode::WrReg,
            23 => Opcode::WrMem,
            24 => Opcode::Piece,
            _ => return None,
        };
        Some(op)
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Number => "NUMBER",
            Opcode::Register => "REGISTER",
            Opcode::Fp => "FP",
            Opcode::Deref => "DEREF",
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::Mul => "MUL",
            Opcode::Div => "DIV",
            Opcode::And => "AND",
            Opcode::Or => "OR",
            Opcode::Xor => "XOR",
            Opcode::Neg => "NEG",
            Opcode::Ge => "GE",
            Opcode::Gt => "GT",
            Opcode::Le => "LE",
            Opcode::Lt => "LT",
            Opcode::Shl => "SHL",
            Opcode::Shr => "SHR",
            Opcode::Arg => "ARG",
            Opcode::Location => "LOCATION",
            Opcode::Fcall => "FCALL",
            Opcode::WrReg => "WR_REG",
            Opcode::WrMem => "WR_MEM",
            Opcode::Piece => "PIECE",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// デコード済みのコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Number(i128),
    /// 廃止: レジスタの値を積む
    Register(String),
    Fp,
    /// 廃止: アドレスを取り出してメモリの値を積む
    Deref {
        size: usize,
        big_endian: Option<bool>,
    },
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    Xor,
    Neg,
    Ge,
    Gt,
    Le,
    Lt,
    Shl,
    Shr,
    Arg(usize),
    /// DWARF 位置式を評価する
    Location {
        expr: Vec<u8>,
        params: PropertyBag,
    },
    /// 関数呼び出し（`argc` 個の引数と呼び出し先）
    Fcall {
        argc: usize,
    },
    WrReg(String),
    WrMem,
    /// `size` はバイト単位
    Piece {
        size: u64,
        bit_offset: Option<u64>,
    },
}

fn malformed(msg: impl Into<String>) -> EvaluationErrorKind {
    EvaluationErrorKind::MalformedCommand(msg.into())
}

struct Operands<'a> {
    opcode: Opcode,
    items: &'a [Value],
}

impl<'a> Operands<'a> {
    fn get(&self, index: usize) -> Option<&'a Value> {
        self.items.get(index).filter(|v| !v.is_null())
    }

    fn require(&self, index: usize) -> Result<&'a Value, EvaluationErrorKind> {
        self.get(index)
            .ok_or_else(|| malformed(format!("{} requires operand {}", self.opcode, index + 1)))
    }

    fn int(&self, index: usize) -> Result<i128, EvaluationErrorKind> {
        let value = self.require(index)?;
        value
            .as_int()
            .ok_or_else(|| malformed(format!("{} operand must be an integer, found {}", self.opcode, value.kind())))
    }

    fn unsigned(&self, index: usize) -> Result<u64, EvaluationErrorKind> {
        let n = self.int(index)?;
        u64::try_from(n).map_err(|_| malformed(format!("{} operand {} is out of range", self.opcode, n)))
    }

    /// 個数・サイズ用のオペランド
    fn count(&self, index: usize) -> Result<usize, EvaluationErrorKind> {
        let n = self.unsigned(index)?;
        usize::try_from(n).map_err(|_| malformed(format!("{} operand {} is out of range", self.opcode, n)))
    }

    fn opt_unsigned(&self, index: usize) -> Result<Option<u64>, EvaluationErrorKind> {
        match self.get(index) {
            None => Ok(None),
            Some(_) => self.unsigned(index).map(Some),
        }
    }

    fn string(&self, index: usize) -> Result<String, EvaluationErrorKind> {
        let value = self.require(index)?;
        match value {
            Value::Str(s) => Ok(s.clone()),
            Value::Int(n) => Ok(n.to_string()),
            other => Err(malformed(format!("{} operand must be a string, found {}", self.opcode, other.kind()))),
        }
    }

    fn bytes(&self, index: usize) -> Result<Vec<u8>, EvaluationErrorKind> {
        match self.require(index)? {
            Value::Bytes(bytes) => Ok(bytes.clone()),
            Value::List(items) => items
                .iter()
                .map(|item| item.as_int().and_then(|n| u8::try_from(n).ok()))
                .collect::<Option<Vec<u8>>>()
                .ok_or_else(|| malformed("LOCATION expression must be a byte list")),
            other => Err(malformed(format!("LOCATION expression must be bytes, found {}", other.kind()))),
        }
    }
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::Number(_) => Opcode::Number,
            Command::Register(_) => Opcode::Register,
            Command::Fp => Opcode::Fp,
            Command::Deref { .. } => Opcode::Deref,
            Command::Add => Opcode::Add,
            Command::Sub => Opcode::Sub,
            Command::Mul => Opcode::Mul,
            Command::Div => Opcode::Div,
            Command::And => Opcode::And,
            Command::Or => Opcode::Or,
            Command::Xor => Opcode::Xor,
            Command::Neg => Opcode::Neg,
            Command::Ge => Opcode::Ge,
            Command::Gt => Opcode::Gt,
            Command::Le => Opcode::Le,
            Command::Lt => Opcode::Lt,
            Command::Shl => Opcode::Shl,
            Command::Shr => Opcode::Shr,
            Command::Arg(_) => Opcode::Arg,
            Command::Location { .. } => Opcode::Location,
            Command::Fcall { .. } => Opcode::Fcall,
            Command::WrReg(_) => Opcode::WrReg,
            Command::WrMem => Opcode::WrMem,
            Command::Piece { .. } => Opcode::Piece,
        }
    }

    /// ワイヤ形式からデコードする
    ///
    /// 失敗した場合、オペコードが判明していればそれも返します。
    pub fn decode(value: &Value) -> Result<Self, (Option<Opcode>, EvaluationErrorKind)> {
        let (code, items) = match value {
            Value::Int(code) => (*code, &[][..]),
            Value::List(list) => match list.split_first() {
                Some((Value::Int(code), rest)) => (*code, rest),
                Some((other, _)) => {
                    return Err((None, malformed(format!("command code must be an integer, found {}", other.kind()))))
                }
                None => return Err((None, malformed("empty command"))),
            },
            other => return Err((None, malformed(format!("command must be a list, found {}", other.kind())))),
        };

        let opcode = Opcode::from_code(code).ok_or((None, EvaluationErrorKind::UnknownOpcode(code)))?;
        let ops = Operands { opcode, items };
        Self::decode_operands(&ops).map_err(|kind| (Some(opcode), kind))
    }

    fn decode_operands(ops: &Operands) -> Result<Self, EvaluationErrorKind> {
        let command = match ops.opcode {
            Opcode::Number => Command::Number(ops.int(0)?),
            Opcode::Register => Command::Register(ops.string(0)?),
            Opcode::Fp => Command::Fp,
            Opcode::Deref => Command::Deref {
                size: ops.count(0)?,
                big_endian: match ops.get(1) {
                    None => None,
                    Some(Value::Bool(b)) => Some(*b),
                    Some(other) => {
                        return Err(malformed(format!("DEREF endianness must be a boolean, found {}", other.kind())))
                    }
                },
            },
            Opcode::Add => Command::Add,
            Opcode::Sub => Command::Sub,
            Opcode::Mul => Command::Mul,
            Opcode::Div => Command::Div,
            Opcode::And => Command::And,
            Opcode::Or => Command::Or,
            Opcode::Xor => Command::Xor,
            Opcode::Neg => Command::Neg,
            Opcode::Ge => Command::Ge,
            Opcode::Gt => Command::Gt,
            Opcode::Le => Command::Le,
            Opcode::Lt => Command::Lt,
            Opcode::Shl => Command::Shl,
            Opcode::Shr => Command::Shr,
            Opcode::Arg => Command::Arg(ops.count(0)?),
            Opcode::Location => Command::Location {
                expr: ops.bytes(0)?,
                params: match ops.get(1) {
                    None => PropertyBag::new(),
                    Some(Value::Bag(bag)) => bag.clone(),
                    Some(other) => {
                        return Err(malformed(format!("LOCATION parameters must be a property bag, found {}", other.kind())))
                    }
                },
            },
            Opcode::Fcall => Command::Fcall {
                argc: match ops.get(0) {
                    None => 0,
                    Some(_) => ops.count(0)?,
                },
            },
            Opcode::WrReg => Command::WrReg(ops.string(0)?),
            Opcode::WrMem => Command::WrMem,
            Opcode::Piece => Command::Piece {
                size: ops.unsigned(0)?,
                bit_offset: ops.opt_unsigned(1)?,
            },
        };
        Ok(command)
    }

    /// ワイヤ形式にエンコードする
    pub fn encode(&self) -> Value {
        let code = Value::from(self.opcode().code());
        let operands: Vec<Value> = match self {
            Command::Number(n) => vec![Value::Int(*n)],
            Command::Register(id) | Command::WrReg(id) => vec![id.as_str().into()],
            Command::Deref { size, big_endian } => {
                let mut v = vec![Value::from(*size)];
                if let Some(be) = big_endian {
                    v.push((*be).into());
                }
                v
            }
            Command::Arg(i) => vec![Value::from(*i)],
            Command::Location { expr, params } => {
                vec![Value::Bytes(expr.clone()), Value::Bag(params.clone())]
            }
            Command::Fcall { argc } => vec![Value::from(*argc)],
            Command::Piece { size, bit_offset } => {
                let mut v = vec![Value::from(*size)];
                if let Some(off) = bit_offset {
                    v.push((*off).into());
                }
                v
            }
            _ => return code,
        };

        let mut list = vec![code];
        list.extend(operands);
        Value::List(list)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::Number(n) => write!(f, "NUMBER({})", n),
            Command::Register(id) => write!(f, "REGISTER({})", id),
            Command::Deref { size, .. } => write!(f, "DEREF({})", size),
            Command::Arg(i) => write!(f, "ARG({})", i),
            Command::Location { expr, .. } => write!(f, "LOCATION({} bytes)", expr.len()),
            Command::Fcall { argc } => write!(f, "FCALL({})", argc),
            Command::WrReg(id) => write!(f, "WR_REG({})", id),
            Command::Piece { size, .. } => write!(f, "PIECE({})", size),
            other => write!(f, "{}", other.opcode()),
        }
    }
}

/// コマンド列
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
    commands: Vec<Command>,
}

impl Program {
    pub fn new(commands: Vec<Command>) -> Self {
        Self { commands }
    }

    /// ワイヤ形式のコマンドリストをデコードする
    pub fn decode(values: &[Value]) -> Result<Self, EvaluationError> {
        let commands = values
            .iter()
            .enumerate()
            .map(|(index, value)| {
                Command::decode(value).map_err(|(opcode, kind)| EvaluationError::new(index, opcode, kind))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { commands })
    }

    /// リスト値からデコードする
    pub fn from_value(value: &Value) -> Result<Self, EvaluationError> {
        match value {
            Value::List(items) => Self::decode(items),
            Value::Null => Ok(Self::default()),
            other => Err(EvaluationError::new(
                0,
                None,
                malformed(format!("command list expected, found {}", other.kind())),
            )),
        }
    }

    pub fn encode(&self) -> Value {
        Value::List(self.commands.iter().map(Command::encode).collect())
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl FromIterator<Command> for Program {
    fn from_iter<I: IntoIterator<Item = Command>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, command) in self.commands.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", command)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_wire_commands() {
        let wire = vec![
            Value::list([1, 4]),
            Value::Int(3),
            Value::list([Value::from(22), Value::from("R7")]),
            Value::list([Value::from(24), Value::from(4), Value::from(8)]),
            Value::list([21]),
        ];
        let program = Program::decode(&wire).unwrap();
        assert_eq!(
            program.commands(),
            &[
                Command::Number(4),
                Command::Fp,
                Command::WrReg("R7".to_string()),
                Command::Piece {
                    size: 4,
                    bit_offset: Some(8)
                },
                Command::Fcall { argc: 0 },
            ]
        );
        assert_eq!(program.to_string(), "NUMBER(4) FP WR_REG(R7) PIECE(4) FCALL(0)");
    }

    #[test]
    fn test_unknown_opcode_reports_index() {
        let wire = vec![Value::list([1, 1]), Value::list([99])];
        let err = Program::decode(&wire).unwrap_err();
        assert_eq!(err.index, 1);
        assert_eq!(err.kind, EvaluationErrorKind::UnknownOpcode(99));
    }

    #[test]
    fn test_missing_operand_is_malformed() {
        let err = Program::decode(&[Value::list([19])]).unwrap_err();
        assert_eq!(err.opcode, Some(Opcode::Arg));
        assert!(matches!(err.kind, EvaluationErrorKind::MalformedCommand(_)));
    }

    #[test]
    fn test_encode_matches_wire_form() {
        let program: Program = vec![Command::Number(-8), Command::Add, Command::Arg(1)]
            .into_iter()
            .collect();
        assert_eq!(
            program.encode(),
            Value::list([Value::list([1, -8]), Value::Int(5), Value::list([19, 1])])
        );
        assert_eq!(Program::from_value(&program.encode()).unwrap(), program);
    }

    #[test]
    fn test_retired_codes_keep_their_meaning() {
        assert_eq!(Opcode::from_code(2), Some(Opcode::Register));
        assert_eq!(Opcode::from_code(4), Some(Opcode::Deref));
        let deref = Command::decode(&Value::list([Value::from(4), Value::from(8), Value::from(true)])).unwrap();
        assert_eq!(
            deref,
            Command::Deref {
                size: 8,
                big_endian: Some(true)
            }
        );
    }
}
