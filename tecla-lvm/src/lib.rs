//! Tecla 位置式評価器
//!
//! このクレートは、エージェントから受け取った位置式（スタックマシンのコマンド列）を
//! 評価して、レジスタやフレームポインタなどの格納場所を求める機能を提供します。
//! LOCATION コマンドに埋め込まれた DWARF 式は gimli で評価します。

pub mod context;
pub mod dwarf;
pub mod error;
pub mod machine;
pub mod opcode;
pub mod target;
pub mod value;

pub use context::{EvalContext, FunctionCall, TargetAccess};
pub use error::{AccessError, EvaluationError, EvaluationErrorKind};
pub use machine::{evaluate, evaluate_wire};
pub use opcode::{Command, Opcode, Program};
pub use target::StaticTarget;
pub use value::{decode_number, encode_number, Located, Location, Piece, PieceSource, StackValue};

/// 評価の結果型
pub type Result<T> = error::Result<T>;
