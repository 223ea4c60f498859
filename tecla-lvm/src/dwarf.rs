//! DWARF ロケーション式評価
//!
//! LOCATION コマンドの中身を gimli で評価し、スタック値に変換します。

use crate::context::EvalContext;
use crate::error::EvaluationErrorKind;
use crate::value::{decode_number, encode_number, Location, Piece, PieceSource, StackValue};
use gimli::{EndianSlice, Evaluation, EvaluationResult, Reader, RunTimeEndian};
use tecla_protocol::PropertyBag;

/// LOCATION パラメータのプロパティ名
pub const PARAM_ADDRESS_SIZE: &str = "AddressSize";
pub const PARAM_BIG_ENDIAN: &str = "BigEndian";
pub const PARAM_DWARF_VERSION: &str = "DwarfVersion";

const DEFAULT_DWARF_VERSION: u16 = 4;

type Step<T> = Result<T, EvaluationErrorKind>;

fn dwarf_error(err: gimli::Error) -> EvaluationErrorKind {
    EvaluationErrorKind::Dwarf(err.to_string())
}

fn bad_param(err: tecla_protocol::DecodeError) -> EvaluationErrorKind {
    EvaluationErrorKind::MalformedCommand(err.to_string())
}

/// 評価に使う DWARF エンコーディング
struct Params {
    big_endian: bool,
    encoding: gimli::Encoding,
}

impl Params {
    fn from_bag(params: &PropertyBag, ctx: &EvalContext) -> Step<Self> {
        let address_size = match params.get_u64(PARAM_ADDRESS_SIZE).map_err(bad_param)? {
            Some(n) => u8::try_from(n)
                .map_err(|_| EvaluationErrorKind::MalformedCommand(format!("address size {}", n)))?,
            None => ctx.address_size(),
        };
        let version = match params.get_u64(PARAM_DWARF_VERSION).map_err(bad_param)? {
            Some(n) => u16::try_from(n)
                .map_err(|_| EvaluationErrorKind::MalformedCommand(format!("DWARF version {}", n)))?,
            None => DEFAULT_DWARF_VERSION,
        };
        let big_endian = params
            .get_bool(PARAM_BIG_ENDIAN)
            .map_err(bad_param)?
            .unwrap_or(ctx.big_endian());

        Ok(Self {
            big_endian,
            encoding: gimli::Encoding {
                format: gimli::Format::Dwarf32,
                version,
                address_size,
            },
        })
    }
}

/// DWARF 式を評価する
///
/// # Arguments
/// * `expr` - DWARF 式のバイト列
/// * `params` - LOCATION コマンドのパラメータ
/// * `ctx` - 評価コンテキスト（レジスタ・メモリ・フレームベース）
pub fn evaluate_location(expr: &[u8], params: &PropertyBag, ctx: &EvalContext) -> Step<StackValue> {
    let params = Params::from_bag(params, ctx)?;
    let endian = if params.big_endian {
        RunTimeEndian::Big
    } else {
        RunTimeEndian::Little
    };
    let expression = gimli::Expression(EndianSlice::new(expr, endian));
    let mut eval = expression.evaluation(params.encoding);

    run(&mut eval, ctx, params.big_endian)?;
    convert_result(eval.result(), ctx, params.big_endian)
}

fn run<R: Reader<Offset = usize>>(
    eval: &mut Evaluation<R>,
    ctx: &EvalContext,
    big_endian: bool,
) -> Step<()> {
    let mut state = eval.evaluate().map_err(dwarf_error)?;
    loop {
        state = match state {
            EvaluationResult::Complete => return Ok(()),
            EvaluationResult::RequiresRegister { register, .. } => {
                let id = register_id(register.0, ctx)?;
                let bytes = ctx.access().read_register(&id)?;
                let value = generic(&bytes, big_endian)?;
                eval.resume_with_register(gimli::Value::Generic(value))
                    .map_err(dwarf_error)?
            }
            EvaluationResult::RequiresFrameBase => {
                let fb = ctx.frame_base().ok_or(EvaluationErrorKind::NoFrameBase)?;
                eval.resume_with_frame_base(fb).map_err(dwarf_error)?
            }
            EvaluationResult::RequiresMemory { address, size, .. } => {
                let bytes = ctx.access().read_memory(address, size as usize, big_endian)?;
                let value = generic(&bytes, big_endian)?;
                eval.resume_with_memory(gimli::Value::Generic(value))
                    .map_err(dwarf_error)?
            }
            other => {
                return Err(EvaluationErrorKind::Unsupported(format!(
                    "DWARF evaluation request {:?}",
                    other
                )))
            }
        };
    }
}

/// gimli は Generic 値を u64 として扱う
fn generic(bytes: &[u8], big_endian: bool) -> Step<u64> {
    let n = decode_number(bytes, big_endian)?;
    u64::try_from(n).map_err(|_| EvaluationErrorKind::TooWide(bytes.len()))
}

fn register_id(regno: u16, ctx: &EvalContext) -> Step<String> {
    ctx.access()
        .dwarf_register(regno)
        .ok_or_else(|| EvaluationErrorKind::Unsupported(format!("DWARF register {}", regno)))
}

fn value_to_number(value: gimli::Value) -> Step<i128> {
    let n = match value {
        gimli::Value::Generic(v) => v as i128,
        gimli::Value::I8(v) => v as i128,
        gimli::Value::U8(v) => v as i128,
        gimli::Value::I16(v) => v as i128,
        gimli::Value::U16(v) => v as i128,
        gimli::Value::I32(v) => v as i128,
        gimli::Value::U32(v) => v as i128,
        gimli::Value::I64(v) => v as i128,
        gimli::Value::U64(v) => v as i128,
        gimli::Value::F32(_) | gimli::Value::F64(_) => {
            return Err(EvaluationErrorKind::Unsupported(
                "floating point DWARF value".to_string(),
            ))
        }
    };
    Ok(n)
}

fn convert_result<R: Reader<Offset = usize>>(
    pieces: Vec<gimli::Piece<R>>,
    ctx: &EvalContext,
    big_endian: bool,
) -> Step<StackValue> {
    match pieces.as_slice() {
        [] => Err(EvaluationErrorKind::EmptyResult),
        [single] if single.size_in_bits.is_none() => match &single.location {
            gimli::Location::Address { address } => Ok(Location::Memory(*address).into()),
            gimli::Location::Register { register } => {
                Ok(Location::Register(register_id(register.0, ctx)?).into())
            }
            gimli::Location::Value { value } => Ok(StackValue::Number(value_to_number(*value)?)),
            gimli::Location::Bytes { value } => {
                let bytes = value.to_slice().map_err(dwarf_error)?;
                Ok(StackValue::Number(decode_number(&bytes, big_endian)?))
            }
            gimli::Location::Empty => Err(EvaluationErrorKind::EmptyResult),
            other => Err(EvaluationErrorKind::Unsupported(format!("DWARF location {:?}", other))),
        },
        pieces => pieces
            .iter()
            .map(|piece| convert_piece(piece, ctx, big_endian))
            .collect::<Step<Vec<_>>>()
            .map(StackValue::Pieces),
    }
}

fn convert_piece<R: Reader<Offset = usize>>(
    piece: &gimli::Piece<R>,
    ctx: &EvalContext,
    big_endian: bool,
) -> Step<Piece> {
    let size = piece
        .size_in_bits
        .map(|bits| bits.div_ceil(8))
        .unwrap_or(ctx.address_size() as u64);

    let source = match &piece.location {
        gimli::Location::Address { address } => PieceSource::Memory(*address),
        gimli::Location::Register { register } => PieceSource::Register(register_id(register.0, ctx)?),
        gimli::Location::Value { value } => {
            PieceSource::Value(encode_number(value_to_number(*value)?, size as usize, big_endian))
        }
        gimli::Location::Bytes { value } => {
            PieceSource::Value(value.to_slice().map_err(dwarf_error)?.into_owned())
        }
        gimli::Location::Empty => return Err(EvaluationErrorKind::EmptyResult),
        other => {
            return Err(EvaluationErrorKind::Unsupported(format!("DWARF piece {:?}", other)))
        }
    };

    Ok(Piece {
        source,
        size,
        bit_offset: piece.bit_offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::StaticTarget;

    const DW_OP_ADDR: u8 = 0x03;
    const DW_OP_LIT5: u8 = 0x35;
    const DW_OP_REG0: u8 = 0x50;
    const DW_OP_REG1: u8 = 0x51;
    const DW_OP_BREG7: u8 = 0x77;
    const DW_OP_FBREG: u8 = 0x91;
    const DW_OP_PIECE: u8 = 0x93;
    const DW_OP_STACK_VALUE: u8 = 0x9f;

    #[test]
    fn test_frame_base_relative() {
        let target = StaticTarget::new();
        let ctx = EvalContext::new(&target).with_frame_base(0x7000);
        // fbreg +16
        let value = evaluate_location(&[DW_OP_FBREG, 0x10], &PropertyBag::new(), &ctx).unwrap();
        assert_eq!(value, StackValue::Location(Location::Memory(0x7010)));
    }

    #[test]
    fn test_register_relative_reads_register() {
        let target = StaticTarget::new()
            .with_register("rsp", 0x8000u64.to_le_bytes().to_vec())
            .with_dwarf_register(7, "rsp");
        let ctx = EvalContext::new(&target);
        // breg7 +8
        let value = evaluate_location(&[DW_OP_BREG7, 0x08], &PropertyBag::new(), &ctx).unwrap();
        assert_eq!(value, StackValue::Location(Location::Memory(0x8008)));
    }

    #[test]
    fn test_register_and_value_results() {
        let target = StaticTarget::new();
        let ctx = EvalContext::new(&target);
        assert_eq!(
            evaluate_location(&[DW_OP_REG0], &PropertyBag::new(), &ctx).unwrap(),
            StackValue::Location(Location::Register("0".to_string()))
        );
        assert_eq!(
            evaluate_location(&[DW_OP_LIT5, DW_OP_STACK_VALUE], &PropertyBag::new(), &ctx).unwrap(),
            StackValue::Number(5)
        );
    }

    #[test]
    fn test_pieces() {
        let target = StaticTarget::new();
        let ctx = EvalContext::new(&target);
        let expr = [DW_OP_REG0, DW_OP_PIECE, 4, DW_OP_REG1, DW_OP_PIECE, 4];
        let value = evaluate_location(&expr, &PropertyBag::new(), &ctx).unwrap();
        assert_eq!(
            value,
            StackValue::Pieces(vec![
                Piece { source: PieceSource::Register("0".into()), size: 4, bit_offset: None },
                Piece { source: PieceSource::Register("1".into()), size: 4, bit_offset: None },
            ])
        );
    }

    #[test]
    fn test_address_size_parameter() {
        let target = StaticTarget::new();
        let ctx = EvalContext::new(&target);
        let params = PropertyBag::builder().with(PARAM_ADDRESS_SIZE, 4).build();
        let expr = [DW_OP_ADDR, 0x78, 0x56, 0x34, 0x12];
        assert_eq!(
            evaluate_location(&expr, &params, &ctx).unwrap(),
            StackValue::Location(Location::Memory(0x12345678))
        );

        let big = PropertyBag::builder()
            .with(PARAM_ADDRESS_SIZE, 4)
            .with(PARAM_BIG_ENDIAN, true)
            .build();
        assert_eq!(
            evaluate_location(&expr, &big, &ctx).unwrap(),
            StackValue::Location(Location::Memory(0x78563412))
        );
    }

    #[test]
    fn test_missing_frame_base() {
        let target = StaticTarget::new();
        let ctx = EvalContext::new(&target);
        assert_eq!(
            evaluate_location(&[DW_OP_FBREG, 0x00], &PropertyBag::new(), &ctx),
            Err(EvaluationErrorKind::NoFrameBase)
        );
    }
}
