//! 評価コンテキストとアクセサ

use crate::error::AccessError;
use crate::value::StackValue;

/// 対象のメモリ・レジスタへのアクセス
///
/// 評価器はアクセサを所有せず、評価のたびに借用します。
pub trait TargetAccess {
    /// メモリを読み取る
    ///
    /// # Arguments
    /// * `addr` - 開始アドレス
    /// * `size` - バイト数
    /// * `big_endian` - 値を解釈する側のバイトオーダー
    fn read_memory(&self, addr: u64, size: usize, big_endian: bool) -> Result<Vec<u8>, AccessError>;

    /// レジスタの生バイト列を読み取る
    fn read_register(&self, id: &str) -> Result<Vec<u8>, AccessError>;

    /// DWARF レジスタ番号をレジスタIDに変換する
    fn dwarf_register(&self, regno: u16) -> Option<String> {
        Some(regno.to_string())
    }
}

/// FCALL の呼び出し先
///
/// 呼び出し規約はエージェント側で定義されるため、評価器は引数の受け渡しだけを行います。
pub trait FunctionCall {
    /// # Arguments
    /// * `target` - 呼び出し先（スタックの最上位にあった値）
    /// * `args` - 引数（積まれた順）
    fn call(&self, target: &StackValue, args: &[StackValue]) -> Result<i128, AccessError>;
}

/// 一回の評価に使うコンテキスト
pub struct EvalContext<'a> {
    access: &'a dyn TargetAccess,
    frame_base: Option<u64>,
    args: Vec<StackValue>,
    big_endian: bool,
    address_size: u8,
    fcall: Option<&'a dyn FunctionCall>,
}

impl<'a> EvalContext<'a> {
    pub fn new(access: &'a dyn TargetAccess) -> Self {
        Self {
            access,
            frame_base: None,
            args: Vec::new(),
            big_endian: false,
            address_size: 8,
            fcall: None,
        }
    }

    pub fn with_frame_base(mut self, frame_base: u64) -> Self {
        self.frame_base = Some(frame_base);
        self
    }

    pub fn with_args(mut self, args: Vec<StackValue>) -> Self {
        self.args = args;
        self
    }

    pub fn with_arg(mut self, arg: impl Into<StackValue>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_big_endian(mut self, big_endian: bool) -> Self {
        self.big_endian = big_endian;
        self
    }

    pub fn with_address_size(mut self, address_size: u8) -> Self {
        self.address_size = address_size;
        self
    }

    pub fn with_function_call(mut self, fcall: &'a dyn FunctionCall) -> Self {
        self.fcall = Some(fcall);
        self
    }

    pub fn access(&self) -> &'a dyn TargetAccess {
        self.access
    }

    pub fn frame_base(&self) -> Option<u64> {
        self.frame_base
    }

    pub fn args(&self) -> &[StackValue] {
        &self.args
    }

    pub fn big_endian(&self) -> bool {
        self.big_endian
    }

    pub fn address_size(&self) -> u8 {
        self.address_size
    }

    pub fn function_call(&self) -> Option<&'a dyn FunctionCall> {
        self.fcall
    }
}
