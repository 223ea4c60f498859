//! ワイヤ形式の位置式評価のテスト

use assert_matches::assert_matches;
use tecla_lvm::{
    evaluate_wire, EvalContext, EvaluationErrorKind, Located, Opcode, PieceSource, Program,
    StackValue, StaticTarget,
};
use tecla_protocol::{PropertyBag, Value};

fn cmd(code: u8, operands: &[Value]) -> Value {
    let mut list = vec![Value::from(code)];
    list.extend(operands.iter().cloned());
    Value::List(list)
}

#[test]
fn test_frame_pointer_scenario() {
    let target = StaticTarget::new();
    let ctx = EvalContext::new(&target).with_frame_base(0x1000);
    let wire = vec![
        cmd(1, &[4.into()]),
        cmd(1, &[3.into()]),
        cmd(5, &[]),
        Value::from(3),
        Value::from(5),
    ];
    assert_eq!(evaluate_wire(&wire, &ctx).unwrap(), Located::Memory(0x1007));
}

#[test]
fn test_evaluation_is_deterministic() {
    let target = StaticTarget::new()
        .with_memory(0x2000, 0x4000u64.to_le_bytes().to_vec())
        .with_register("R3", vec![0x00, 0x20, 0, 0, 0, 0, 0, 0]);
    let ctx = EvalContext::new(&target).with_frame_base(0x100);
    // REGISTER(R3) DEREF(8) FP ADD
    let wire = vec![
        cmd(2, &["R3".into()]),
        cmd(4, &[8.into()]),
        cmd(3, &[]),
        cmd(5, &[]),
    ];

    let first = evaluate_wire(&wire, &ctx);
    let second = evaluate_wire(&wire, &ctx);
    assert_eq!(first, Ok(Located::Memory(0x4100)));
    assert_eq!(first, second);
}

#[test]
fn test_failed_evaluation_does_not_leak_into_next() {
    let target = StaticTarget::new();
    let ctx = EvalContext::new(&target);

    let bad = vec![cmd(1, &[9.into()]), cmd(1, &[0.into()]), cmd(8, &[])];
    let err = evaluate_wire(&bad, &ctx).unwrap_err();
    assert_eq!(err.index, 2);
    assert_eq!(err.opcode, Some(Opcode::Div));
    assert_eq!(err.kind, EvaluationErrorKind::Arithmetic("division by zero"));

    // 新しいスタックで評価される
    let good = vec![cmd(1, &[0x10.into()])];
    assert_eq!(evaluate_wire(&good, &ctx), Ok(Located::Memory(0x10)));
}

#[test]
fn test_every_short_stack_is_an_error() {
    let target = StaticTarget::new();
    let ctx = EvalContext::new(&target);

    for code in [5u8, 6, 7, 8, 9, 10, 11, 13, 14, 15, 16, 17, 18] {
        let err = evaluate_wire(&[cmd(1, &[1.into()]), cmd(code, &[])], &ctx).unwrap_err();
        assert_eq!(err.index, 1, "opcode {}", code);
        assert_matches!(err.kind, EvaluationErrorKind::StackUnderflow { needed: 2, depth: 1 });
    }
    for op in [cmd(12, &[]), cmd(23, &[]), cmd(24, &[4.into()]), cmd(4, &[4.into()])] {
        let err = evaluate_wire(&[op], &ctx).unwrap_err();
        assert_matches!(err.kind, EvaluationErrorKind::StackUnderflow { needed: 1, depth: 0 });
    }
    let err = evaluate_wire(&[cmd(21, &[2.into()])], &ctx).unwrap_err();
    assert_matches!(err.kind, EvaluationErrorKind::StackUnderflow { needed: 3, depth: 0 });
}

#[test]
fn test_huge_counts_fail_without_panicking() {
    let target = StaticTarget::new();
    let ctx = EvalContext::new(&target);

    let err = evaluate_wire(&[cmd(21, &[Value::Int(u64::MAX as i128)])], &ctx).unwrap_err();
    assert_eq!(err.index, 0);
    assert_matches!(err.kind, EvaluationErrorKind::StackUnderflow { depth: 0, .. });

    // 引数が一つだけ積まれた状態でも同じ
    let err = evaluate_wire(
        &[cmd(1, &[7.into()]), cmd(21, &[Value::Int(u64::MAX as i128 - 1)])],
        &ctx,
    )
    .unwrap_err();
    assert_eq!(err.index, 1);
    assert_matches!(err.kind, EvaluationErrorKind::StackUnderflow { depth: 1, .. });

    let err = evaluate_wire(&[cmd(19, &[Value::Int(u64::MAX as i128)])], &ctx).unwrap_err();
    assert_matches!(err.kind, EvaluationErrorKind::MissingArgument { .. });

    let err = evaluate_wire(&[cmd(21, &[Value::Int(-1)])], &ctx).unwrap_err();
    assert_matches!(err.kind, EvaluationErrorKind::MalformedCommand(_));
}

#[test]
fn test_nested_dwarf_location() {
    let target = StaticTarget::new();
    let ctx = EvalContext::new(&target).with_frame_base(0x7ff0);
    // DW_OP_fbreg -8
    let params = PropertyBag::builder().with("DwarfVersion", 5).build();
    let wire = vec![cmd(20, &[Value::Bytes(vec![0x91, 0x78]), params.into()])];
    assert_eq!(evaluate_wire(&wire, &ctx), Ok(Located::Memory(0x7fe8)));
}

#[test]
fn test_split_variable_reads_all_pieces() {
    let target = StaticTarget::new()
        .with_register("R0", vec![0xaa, 0xbb, 0xcc, 0xdd])
        .with_memory(0x500, vec![0x11, 0x22, 0x33, 0x44]);
    let ctx = EvalContext::new(&target);
    let wire = vec![
        cmd(22, &["R0".into()]),
        cmd(24, &[2.into()]),
        cmd(1, &[0x500.into()]),
        cmd(24, &[2.into()]),
    ];

    let located = evaluate_wire(&wire, &ctx).unwrap();
    assert_matches!(&located, Located::Composite(pieces) if pieces.len() == 2);
    if let Located::Composite(pieces) = &located {
        assert_eq!(pieces[0].source, PieceSource::Register("R0".into()));
        assert_eq!(pieces[1].source, PieceSource::Memory(0x500));
    }
    assert_eq!(located.read(4, &target, false).unwrap(), vec![0xaa, 0xbb, 0x11, 0x22]);
}

#[test]
fn test_arguments_and_wire_round_trip() {
    let target = StaticTarget::new();
    let ctx = EvalContext::new(&target).with_args(vec![StackValue::Number(0x3000)]);
    let wire = vec![cmd(19, &[0.into()]), cmd(1, &[0x18.into()]), cmd(5, &[]), cmd(23, &[])];

    let program = Program::decode(&wire).unwrap();
    assert_eq!(program.evaluate(&ctx), Ok(Located::Memory(0x3018)));
    assert_eq!(Program::from_value(&program.encode()).unwrap(), program);
}
