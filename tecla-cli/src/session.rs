//! 評価セッション
//!
//! 静的ターゲットと評価設定をまとめ、JSON のコマンド列を評価します。

use crate::parse::{parse_address, parse_hex_bytes, split_assignment};
use anyhow::{anyhow, Result};
use tecla_lvm::{evaluate_wire, EvalContext, Located, StackValue, StaticTarget};
use tecla_protocol::Value;
use tracing::debug;

/// オフライン評価の状態
#[derive(Debug, Clone)]
pub struct Session {
    target: StaticTarget,
    frame_base: Option<u64>,
    args: Vec<i128>,
    big_endian: bool,
    address_size: u8,
    last: Option<Located>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            target: StaticTarget::new(),
            frame_base: None,
            args: Vec::new(),
            big_endian: false,
            address_size: 8,
            last: None,
        }
    }

    pub fn target(&self) -> &StaticTarget {
        &self.target
    }

    pub fn frame_base(&self) -> Option<u64> {
        self.frame_base
    }

    pub fn set_frame_base(&mut self, frame_base: u64) {
        self.frame_base = Some(frame_base);
    }

    pub fn args(&self) -> &[i128] {
        &self.args
    }

    pub fn push_arg(&mut self, arg: i128) {
        self.args.push(arg);
    }

    pub fn clear_args(&mut self) {
        self.args.clear();
    }

    pub fn big_endian(&self) -> bool {
        self.big_endian
    }

    pub fn set_big_endian(&mut self, big_endian: bool) {
        self.big_endian = big_endian;
    }

    pub fn address_size(&self) -> u8 {
        self.address_size
    }

    pub fn set_address_size(&mut self, address_size: u8) {
        self.address_size = address_size;
    }

    pub fn last(&self) -> Option<&Located> {
        self.last.as_ref()
    }

    pub fn add_memory(&mut self, addr: u64, bytes: Vec<u8>) {
        self.target.add_memory(addr, bytes);
    }

    pub fn set_register(&mut self, id: &str, bytes: Vec<u8>) {
        self.target.set_register(id, bytes);
    }

    /// `ADDR=HEX` 形式のメモリ指定を取り込む
    pub fn load_memory_spec(&mut self, spec: &str) -> Result<()> {
        let (addr, bytes) = split_assignment(spec)?;
        self.add_memory(parse_address(addr)?, parse_hex_bytes(bytes)?);
        Ok(())
    }

    /// `ID=HEX` 形式のレジスタ指定を取り込む
    pub fn load_register_spec(&mut self, spec: &str) -> Result<()> {
        let (id, bytes) = split_assignment(spec)?;
        self.set_register(id, parse_hex_bytes(bytes)?);
        Ok(())
    }

    /// 現在の設定で評価コンテキストを作る
    pub fn context(&self) -> EvalContext<'_> {
        let ctx = EvalContext::new(&self.target)
            .with_args(self.args.iter().copied().map(StackValue::Number).collect())
            .with_big_endian(self.big_endian)
            .with_address_size(self.address_size);
        match self.frame_base {
            Some(fp) => ctx.with_frame_base(fp),
            None => ctx,
        }
    }

    /// JSON のコマンド列を評価し、結果を直前の結果として保持する
    ///
    /// # Arguments
    /// * `json` - `[[1, 8], [3], 5]` のようなワイヤ形式のコマンド列
    pub fn evaluate(&mut self, json: &str) -> Result<Located> {
        let value = Value::from_json_slice(json.as_bytes())?;
        let commands = value
            .as_list()
            .ok_or_else(|| anyhow!("Expected a JSON list of commands, found {}", value.kind()))?;

        let located = evaluate_wire(commands, &self.context())?;
        debug!("evaluated {} commands: {}", commands.len(), located);
        self.last = Some(located.clone());
        Ok(located)
    }

    /// 直前の評価結果が示すバイト列を読む
    pub fn read_last(&self, size: usize) -> Result<Vec<u8>> {
        let located = self
            .last
            .as_ref()
            .ok_or_else(|| anyhow!("Nothing has been evaluated yet"))?;
        Ok(located.read(size, &self.target, self.big_endian)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluate_frame_relative() {
        let mut session = Session::new();
        session.set_frame_base(0x7ff0);
        session.load_memory_spec("0x7fe8=efbeadde00000000").unwrap();

        // FP NUMBER(-8) ADD
        let located = session.evaluate("[[3], [1, -8], 5]").unwrap();
        assert_eq!(located, Located::Memory(0x7fe8));
        assert_eq!(session.read_last(4).unwrap(), vec![0xef, 0xbe, 0xad, 0xde]);
    }

    #[test]
    fn test_evaluate_register_location() {
        let mut session = Session::new();
        session.load_register_spec("R1=2a00000000000000").unwrap();

        // WR_REG(R1)
        let located = session.evaluate("[[22, \"R1\"]]").unwrap();
        assert_eq!(located, Located::Register("R1".to_string()));
        assert_eq!(session.read_last(1).unwrap(), vec![0x2a]);
    }

    #[test]
    fn test_evaluate_uses_args() {
        let mut session = Session::new();
        session.push_arg(0x100);
        session.push_arg(0x20);
        // ARG(0) ARG(1) ADD
        let located = session.evaluate("[[19, 0], [19, 1], 5]").unwrap();
        assert_eq!(located, Located::Memory(0x120));

        session.clear_args();
        assert!(session.evaluate("[[19, 0], [19, 1], 5]").is_err());
    }

    #[test]
    fn test_evaluate_rejects_non_list() {
        let mut session = Session::new();
        assert!(session.evaluate("{\"a\": 1}").is_err());
        assert!(session.evaluate("not json").is_err());
        assert!(session.last().is_none());
    }

    #[test]
    fn test_read_without_result() {
        let session = Session::new();
        assert!(session.read_last(8).is_err());
    }
}
