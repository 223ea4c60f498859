//! 静的ターゲット
//!
//! メモリ範囲とレジスタ表だけを持つ [`TargetAccess`] 実装です。
//! オフライン評価やテストで使います。

use crate::context::TargetAccess;
use crate::error::AccessError;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Default)]
pub struct StaticTarget {
    /// 開始アドレス -> バイト列
    memory: BTreeMap<u64, Vec<u8>>,
    registers: HashMap<String, Vec<u8>>,
    dwarf_names: HashMap<u16, String>,
}

impl StaticTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memory(mut self, addr: u64, bytes: Vec<u8>) -> Self {
        self.add_memory(addr, bytes);
        self
    }

    pub fn with_register(mut self, id: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.set_register(id, bytes);
        self
    }

    /// DWARF レジスタ番号に名前を割り当てる
    pub fn with_dwarf_register(mut self, regno: u16, id: impl Into<String>) -> Self {
        self.dwarf_names.insert(regno, id.into());
        self
    }

    /// メモリ範囲を追加する（同じ開始アドレスの範囲は置き換える）
    pub fn add_memory(&mut self, addr: u64, bytes: Vec<u8>) {
        self.memory.insert(addr, bytes);
    }

    pub fn set_register(&mut self, id: impl Into<String>, bytes: Vec<u8>) {
        self.registers.insert(id.into(), bytes);
    }

    pub fn registers(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.registers.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn memory_ranges(&self) -> impl Iterator<Item = (u64, usize)> + '_ {
        self.memory.iter().map(|(addr, bytes)| (*addr, bytes.len()))
    }

    fn byte_at(&self, addr: u64) -> Option<u8> {
        let (start, bytes) = self.memory.range(..=addr).next_back()?;
        let offset = usize::try_from(addr - start).ok()?;
        bytes.get(offset).copied()
    }
}

impl TargetAccess for StaticTarget {
    fn read_memory(&self, addr: u64, size: usize, _big_endian: bool) -> Result<Vec<u8>, AccessError> {
        (0..size as u64)
            .map(|i| addr.checked_add(i).and_then(|a| self.byte_at(a)))
            .collect::<Option<Vec<u8>>>()
            .ok_or(AccessError::Memory { addr, size })
    }

    fn read_register(&self, id: &str) -> Result<Vec<u8>, AccessError> {
        self.registers
            .get(id)
            .cloned()
            .ok_or_else(|| AccessError::Register(id.to_string()))
    }

    fn dwarf_register(&self, regno: u16) -> Option<String> {
        Some(
            self.dwarf_names
                .get(&regno)
                .cloned()
                .unwrap_or_else(|| regno.to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_across_adjacent_ranges() {
        let target = StaticTarget::new()
            .with_memory(0x1000, vec![1, 2])
            .with_memory(0x1002, vec![3, 4]);
        assert_eq!(target.read_memory(0x1001, 3, false).unwrap(), vec![2, 3, 4]);
        assert_eq!(
            target.read_memory(0x1003, 2, false),
            Err(AccessError::Memory { addr: 0x1003, size: 2 })
        );
    }

    #[test]
    fn test_registers_and_dwarf_names() {
        let target = StaticTarget::new()
            .with_register("pc", vec![0x10, 0, 0, 0])
            .with_dwarf_register(16, "pc");
        assert_eq!(target.read_register("pc").unwrap(), vec![0x10, 0, 0, 0]);
        assert!(target.read_register("sp").is_err());
        assert_eq!(target.dwarf_register(16).as_deref(), Some("pc"));
        assert_eq!(target.dwarf_register(3).as_deref(), Some("3"));
    }
}
