//! 位置式スタックマシン
//!
//! 評価は毎回新しいスタックで行い、最初のエラーで中断します。

use crate::context::EvalContext;
use crate::dwarf;
use crate::error::{EvaluationError, EvaluationErrorKind, Result};
use crate::opcode::{Command, Program};
use crate::value::{decode_number, Located, Location, Piece, PieceSource, StackValue};
use tecla_protocol::Value;
use tracing::debug;

type Step<T> = std::result::Result<T, EvaluationErrorKind>;

struct Machine<'c, 'a> {
    ctx: &'c EvalContext<'a>,
    stack: Vec<StackValue>,
    pieces: Vec<Piece>,
}

/// コマンド列を評価する
pub fn evaluate(program: &Program, ctx: &EvalContext) -> Result<Located> {
    let mut machine = Machine {
        ctx,
        stack: Vec::new(),
        pieces: Vec::new(),
    };

    for (index, command) in program.commands().iter().enumerate() {
        machine
            .step(command)
            .map_err(|kind| EvaluationError::new(index, Some(command.opcode()), kind))?;
    }

    let located = machine
        .finish()
        .map_err(|kind| EvaluationError::new(program.len(), None, kind))?;
    debug!("Evaluated `{}` to {}", program, located);
    Ok(located)
}

/// ワイヤ形式のコマンド列をデコードして評価する
pub fn evaluate_wire(commands: &[Value], ctx: &EvalContext) -> Result<Located> {
    evaluate(&Program::decode(commands)?, ctx)
}

impl Program {
    pub fn evaluate(&self, ctx: &EvalContext) -> Result<Located> {
        evaluate(self, ctx)
    }
}

fn checked(result: Option<i128>, what: &'static str) -> Step<i128> {
    result.ok_or(EvaluationErrorKind::Arithmetic(what))
}

fn to_address(n: i128) -> Step<u64> {
    u64::try_from(n).map_err(|_| EvaluationErrorKind::Arithmetic("address out of range"))
}

fn shift_count(n: i128) -> Step<u32> {
    if (0..=127).contains(&n) {
        Ok(n as u32)
    } else {
        Err(EvaluationErrorKind::Arithmetic("shift count out of range"))
    }
}

impl<'c, 'a> Machine<'c, 'a> {
    fn require(&self, needed: usize) -> Step<()> {
        if self.stack.len() < needed {
            return Err(EvaluationErrorKind::StackUnderflow {
                needed,
                depth: self.stack.len(),
            });
        }
        Ok(())
    }

    fn pop(&mut self) -> Step<StackValue> {
        self.require(1)?;
        self.stack.pop().ok_or(EvaluationErrorKind::StackUnderflow {
            needed: 1,
            depth: 0,
        })
    }

    fn pop_number(&mut self) -> Step<i128> {
        match self.pop()? {
            StackValue::Number(n) => Ok(n),
            other => Err(EvaluationErrorKind::TypeMismatch {
                expected: "number",
                found: other.kind(),
            }),
        }
    }

    /// 2つの数値を取り出す（先に積まれた方が左辺）
    fn pop_pair(&mut self) -> Step<(i128, i128)> {
        self.require(2)?;
        let rhs = self.pop_number()?;
        let lhs = self.pop_number()?;
        Ok((lhs, rhs))
    }

    fn push(&mut self, value: impl Into<StackValue>) {
        self.stack.push(value.into());
    }

    fn binary(&mut self, op: impl FnOnce(i128, i128) -> Step<i128>) -> Step<()> {
        let (lhs, rhs) = self.pop_pair()?;
        let result = op(lhs, rhs)?;
        self.push(result);
        Ok(())
    }

    fn compare(&mut self, op: impl FnOnce(i128, i128) -> bool) -> Step<()> {
        let (lhs, rhs) = self.pop_pair()?;
        self.push(op(lhs, rhs) as i128);
        Ok(())
    }

    fn step(&mut self, command: &Command) -> Step<()> {
        match command {
            Command::Number(n) => self.push(*n),
            Command::Register(id) => {
                let bytes = self.ctx.access().read_register(id)?;
                let value = decode_number(&bytes, self.ctx.big_endian())?;
                self.push(value);
            }
            Command::Fp => {
                let fp = self.ctx.frame_base().ok_or(EvaluationErrorKind::NoFrameBase)?;
                self.push(fp as i128);
            }
            Command::Deref { size, big_endian } => {
                let addr = to_address(self.pop_number()?)?;
                let big_endian = big_endian.unwrap_or(self.ctx.big_endian());
                let bytes = self.ctx.access().read_memory(addr, *size, big_endian)?;
                self.push(decode_number(&bytes, big_endian)?);
            }
            Command::Add => self.binary(|a, b| checked(a.checked_add(b), "addition overflow"))?,
            Command::Sub => self.binary(|a, b| checked(a.checked_sub(b), "subtraction overflow"))?,
            Command::Mul => {
                self.binary(|a, b| checked(a.checked_mul(b), "multiplication overflow"))?
            }
            Command::Div => self.binary(|a, b| {
                if b == 0 {
                    return Err(EvaluationErrorKind::Arithmetic("division by zero"));
                }
                checked(a.checked_div(b), "division overflow")
            })?,
            Command::And => self.binary(|a, b| Ok(a & b))?,
            Command::Or => self.binary(|a, b| Ok(a | b))?,
            Command::Xor => self.binary(|a, b| Ok(a ^ b))?,
            Command::Neg => {
                let n = self.pop_number()?;
                self.push(checked(n.checked_neg(), "negation overflow")?);
            }
            Command::Ge => self.compare(|a, b| a >= b)?,
            Command::Gt => self.compare(|a, b| a > b)?,
            Command::Le => self.compare(|a, b| a <= b)?,
            Command::Lt => self.compare(|a, b| a < b)?,
            Command::Shl => self.binary(|a, b| {
                let count = shift_count(b)?;
                let shifted = a << count;
                if shifted >> count != a {
                    return Err(EvaluationErrorKind::Arithmetic("shift overflow"));
                }
                Ok(shifted)
            })?,
            Command::Shr => self.binary(|a, b| Ok(a >> shift_count(b)?))?,
            Command::Arg(index) => {
                let args = self.ctx.args();
                let arg = args.get(*index).cloned().ok_or(EvaluationErrorKind::MissingArgument {
                    index: *index,
                    count: args.len(),
                })?;
                self.stack.push(arg);
            }
            Command::Location { expr, params } => {
                let value = dwarf::evaluate_location(expr, params, self.ctx)?;
                self.stack.push(value);
            }
            Command::Fcall { argc } => {
                let needed = argc.checked_add(1).ok_or(EvaluationErrorKind::StackUnderflow {
                    needed: usize::MAX,
                    depth: self.stack.len(),
                })?;
                self.require(needed)?;
                let target = self.pop()?;
                let split = self.stack.len().saturating_sub(*argc);
                let args = self.stack.split_off(split);
                let hook = self
                    .ctx
                    .function_call()
                    .ok_or_else(|| EvaluationErrorKind::Unsupported("function calls".to_string()))?;
                let result = hook.call(&target, &args)?;
                self.push(result);
            }
            Command::WrReg(id) => self.push(Location::Register(id.clone())),
            Command::WrMem => {
                let addr = to_address(self.pop_number()?)?;
                self.push(Location::Memory(addr));
            }
            Command::Piece { size, bit_offset } => {
                let source: PieceSource = match self.pop()? {
                    StackValue::Number(n) => Location::Memory(to_address(n)?).into(),
                    StackValue::Location(location) => location.into(),
                    StackValue::Pieces(_) => {
                        return Err(EvaluationErrorKind::TypeMismatch {
                            expected: "number or location",
                            found: "pieces",
                        })
                    }
                };
                self.pieces.push(Piece {
                    source,
                    size: *size,
                    bit_offset: *bit_offset,
                });
            }
        }
        Ok(())
    }

    fn finish(mut self) -> Step<Located> {
        if !self.pieces.is_empty() {
            return match self.stack.last() {
                None => Ok(Located::Composite(self.pieces)),
                Some(top) => Err(EvaluationErrorKind::TypeMismatch {
                    expected: "empty stack after PIECE",
                    found: top.kind(),
                }),
            };
        }

        match self.pop()? {
            StackValue::Number(n) => Ok(Located::Memory(to_address(n)?)),
            StackValue::Location(Location::Memory(addr)) => Ok(Located::Memory(addr)),
            StackValue::Location(Location::Register(id)) => Ok(Located::Register(id)),
            StackValue::Pieces(pieces) => Ok(Located::Composite(pieces)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AccessError;
    use crate::target::StaticTarget;

    fn run(commands: Vec<Command>, ctx: &EvalContext) -> Result<Located> {
        Program::new(commands).evaluate(ctx)
    }

    #[test]
    fn test_frame_relative_address() {
        let target = StaticTarget::new();
        let ctx = EvalContext::new(&target).with_frame_base(0x1000);
        let located = run(
            vec![Command::Number(4), Command::Number(3), Command::Add, Command::Fp, Command::Add],
            &ctx,
        )
        .unwrap();
        assert_eq!(located, Located::Memory(0x1007));
    }

    #[test]
    fn test_divide_by_zero() {
        let target = StaticTarget::new();
        let ctx = EvalContext::new(&target);
        let err = run(vec![Command::Number(1), Command::Number(0), Command::Div], &ctx).unwrap_err();
        assert_eq!(err.index, 2);
        assert_eq!(err.kind, EvaluationErrorKind::Arithmetic("division by zero"));
    }

    #[test]
    fn test_operand_order() {
        let target = StaticTarget::new();
        let ctx = EvalContext::new(&target);
        assert_eq!(
            run(vec![Command::Number(10), Command::Number(3), Command::Sub], &ctx),
            Ok(Located::Memory(7))
        );
        assert_eq!(
            run(vec![Command::Number(10), Command::Number(3), Command::Div], &ctx),
            Ok(Located::Memory(3))
        );
        assert_eq!(
            run(vec![Command::Number(1), Command::Number(4), Command::Shl], &ctx),
            Ok(Located::Memory(16))
        );
        assert_eq!(
            run(vec![Command::Number(2), Command::Number(3), Command::Lt], &ctx),
            Ok(Located::Memory(1))
        );
        assert_eq!(
            run(vec![Command::Number(2), Command::Number(3), Command::Ge], &ctx),
            Ok(Located::Memory(0))
        );
    }

    #[test]
    fn test_arithmetic_faults() {
        let target = StaticTarget::new();
        let ctx = EvalContext::new(&target);
        let overflow = run(
            vec![Command::Number(i128::MAX), Command::Number(1), Command::Add],
            &ctx,
        )
        .unwrap_err();
        assert_eq!(overflow.kind, EvaluationErrorKind::Arithmetic("addition overflow"));

        let shift = run(vec![Command::Number(1), Command::Number(128), Command::Shl], &ctx).unwrap_err();
        assert_eq!(shift.kind, EvaluationErrorKind::Arithmetic("shift count out of range"));

        let negative = run(vec![Command::Number(-8)], &ctx).unwrap_err();
        assert_eq!(negative.index, 1);
        assert_eq!(negative.opcode, None);
    }

    #[test]
    fn test_underflow_and_type_mismatch() {
        let target = StaticTarget::new();
        let ctx = EvalContext::new(&target);

        let err = run(vec![Command::Number(1), Command::Add], &ctx).unwrap_err();
        assert_eq!(err.index, 1);
        assert_eq!(err.kind, EvaluationErrorKind::StackUnderflow { needed: 2, depth: 1 });

        let err = run(vec![], &ctx).unwrap_err();
        assert_eq!(err.kind, EvaluationErrorKind::StackUnderflow { needed: 1, depth: 0 });

        let err = run(
            vec![Command::WrReg("R0".into()), Command::Number(1), Command::Add],
            &ctx,
        )
        .unwrap_err();
        assert_eq!(
            err.kind,
            EvaluationErrorKind::TypeMismatch {
                expected: "number",
                found: "location"
            }
        );
    }

    #[test]
    fn test_register_and_memory_locations() {
        let target = StaticTarget::new();
        let ctx = EvalContext::new(&target).with_arg(0x2000i128);
        assert_eq!(
            run(vec![Command::WrReg("RSP".into())], &ctx),
            Ok(Located::Register("RSP".into()))
        );
        assert_eq!(
            run(vec![Command::Arg(0), Command::Number(8), Command::Add, Command::WrMem], &ctx),
            Ok(Located::Memory(0x2008))
        );
        let err = run(vec![Command::Arg(1)], &ctx).unwrap_err();
        assert_eq!(err.kind, EvaluationErrorKind::MissingArgument { index: 1, count: 1 });
    }

    #[test]
    fn test_pieces_build_composite() {
        let target = StaticTarget::new();
        let ctx = EvalContext::new(&target);
        let located = run(
            vec![
                Command::WrReg("R0".into()),
                Command::Piece { size: 4, bit_offset: None },
                Command::Number(0x3000),
                Command::Piece { size: 4, bit_offset: None },
            ],
            &ctx,
        )
        .unwrap();
        assert_eq!(
            located,
            Located::Composite(vec![
                Piece { source: PieceSource::Register("R0".into()), size: 4, bit_offset: None },
                Piece { source: PieceSource::Memory(0x3000), size: 4, bit_offset: None },
            ])
        );

        let err = run(
            vec![
                Command::WrReg("R0".into()),
                Command::Piece { size: 4, bit_offset: None },
                Command::Number(1),
            ],
            &ctx,
        )
        .unwrap_err();
        assert!(matches!(err.kind, EvaluationErrorKind::TypeMismatch { .. }));
    }

    #[test]
    fn test_legacy_register_and_deref_use_context_endianness() {
        let target = StaticTarget::new()
            .with_register("R1", vec![0x00, 0x00, 0x10, 0x00])
            .with_memory(0x100000, vec![0x12, 0x34]);

        let little = EvalContext::new(&target);
        assert_eq!(
            run(vec![Command::Register("R1".into())], &little),
            Ok(Located::Memory(0x100000))
        );

        let big = EvalContext::new(&target).with_big_endian(true);
        assert_eq!(
            run(vec![Command::Register("R1".into())], &big),
            Ok(Located::Memory(0x1000))
        );

        let deref = vec![
            Command::Number(0x100000),
            Command::Deref { size: 2, big_endian: None },
        ];
        assert_eq!(run(deref.clone(), &little), Ok(Located::Memory(0x3412)));
        assert_eq!(run(deref, &big), Ok(Located::Memory(0x1234)));
    }

    #[test]
    fn test_accessor_failure_is_evaluation_error() {
        let target = StaticTarget::new();
        let ctx = EvalContext::new(&target);
        let err = run(
            vec![Command::Number(0x10), Command::Deref { size: 4, big_endian: None }],
            &ctx,
        )
        .unwrap_err();
        assert_eq!(err.index, 1);
        assert_eq!(
            err.kind,
            EvaluationErrorKind::Access(AccessError::Memory { addr: 0x10, size: 4 })
        );
    }

    #[test]
    fn test_function_call_hook() {
        struct Sum;

        impl crate::context::FunctionCall for Sum {
            fn call(&self, target: &StackValue, args: &[StackValue]) -> std::result::Result<i128, AccessError> {
                let StackValue::Number(base) = target else {
                    return Err(AccessError::Other("bad target".into()));
                };
                Ok(args.iter().fold(*base, |acc, arg| match arg {
                    StackValue::Number(n) => acc * 10 + n,
                    _ => acc,
                }))
            }
        }

        let target = StaticTarget::new();
        let program = vec![
            Command::Number(1),
            Command::Number(2),
            Command::Number(7),
            Command::Fcall { argc: 2 },
        ];

        let no_hook = EvalContext::new(&target);
        let err = run(program.clone(), &no_hook).unwrap_err();
        assert!(matches!(err.kind, EvaluationErrorKind::Unsupported(_)));

        let sum = Sum;
        let ctx = EvalContext::new(&target).with_function_call(&sum);
        assert_eq!(run(program, &ctx), Ok(Located::Memory(712)));
    }
}
