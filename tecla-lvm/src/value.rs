//! スタック値と評価結果

use crate::context::TargetAccess;
use crate::error::{AccessError, EvaluationErrorKind};
use std::fmt;

/// 値の格納場所
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Register(String),
    Memory(u64),
}

/// ピースの中身
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PieceSource {
    Register(String),
    Memory(u64),
    /// 値そのもの（DWARF の implicit value など）
    Value(Vec<u8>),
}

/// 分割された格納場所の一片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub source: PieceSource,
    /// バイト数
    pub size: u64,
    pub bit_offset: Option<u64>,
}

impl From<Location> for PieceSource {
    fn from(location: Location) -> Self {
        match location {
            Location::Register(id) => PieceSource::Register(id),
            Location::Memory(addr) => PieceSource::Memory(addr),
        }
    }
}

/// 評価スタック上の値
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackValue {
    Number(i128),
    Location(Location),
    Pieces(Vec<Piece>),
}

impl StackValue {
    pub fn kind(&self) -> &'static str {
        match self {
            StackValue::Number(_) => "number",
            StackValue::Location(_) => "location",
            StackValue::Pieces(_) => "pieces",
        }
    }
}

impl From<i128> for StackValue {
    fn from(n: i128) -> Self {
        StackValue::Number(n)
    }
}

impl From<Location> for StackValue {
    fn from(location: Location) -> Self {
        StackValue::Location(location)
    }
}

/// 評価結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Located {
    Memory(u64),
    Register(String),
    Composite(Vec<Piece>),
}

impl Located {
    /// 位置が示すバイト列を読み取る
    ///
    /// 合成位置は各ピースを順に連結し、`size` バイトに切り詰めます。
    /// ビットオフセットは考慮しません。
    pub fn read(
        &self,
        size: usize,
        access: &dyn TargetAccess,
        big_endian: bool,
    ) -> Result<Vec<u8>, AccessError> {
        match self {
            Located::Memory(addr) => access.read_memory(*addr, size, big_endian),
            Located::Register(id) => {
                let bytes = access.read_register(id)?;
                take_bytes(bytes, size, big_endian)
                    .ok_or_else(|| AccessError::Register(id.clone()))
            }
            Located::Composite(pieces) => {
                let mut out = Vec::new();
                for piece in pieces {
                    let len = usize::try_from(piece.size)
                        .map_err(|_| AccessError::Other(format!("piece size {} is out of range", piece.size)))?;
                    let bytes = match &piece.source {
                        PieceSource::Memory(addr) => access.read_memory(*addr, len, big_endian)?,
                        PieceSource::Register(id) => {
                            let bytes = access.read_register(id)?;
                            take_bytes(bytes, len, big_endian)
                                .ok_or_else(|| AccessError::Register(id.clone()))?
                        }
                        PieceSource::Value(bytes) => {
                            take_bytes(bytes.clone(), len, big_endian).ok_or_else(|| {
                                AccessError::Other(format!("value piece is shorter than {} bytes", len))
                            })?
                        }
                    };
                    out.extend(bytes);
                }
                out.truncate(size);
                Ok(out)
            }
        }
    }
}

/// 値の下位 `size` バイトを取り出す
fn take_bytes(mut bytes: Vec<u8>, size: usize, big_endian: bool) -> Option<Vec<u8>> {
    if bytes.len() < size {
        return None;
    }
    if big_endian {
        Some(bytes.split_off(bytes.len() - size))
    } else {
        bytes.truncate(size);
        Some(bytes)
    }
}

impl fmt::Display for Located {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Located::Memory(addr) => write!(f, "memory 0x{:x}", addr),
            Located::Register(id) => write!(f, "register {}", id),
            Located::Composite(pieces) => {
                write!(f, "composite [")?;
                for (i, piece) in pieces.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    match &piece.source {
                        PieceSource::Memory(addr) => write!(f, "memory 0x{:x}", addr)?,
                        PieceSource::Register(id) => write!(f, "register {}", id)?,
                        PieceSource::Value(bytes) => write!(f, "value {:02x?}", bytes)?,
                    }
                    write!(f, ":{}", piece.size)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// バイト列を符号なし整数として解釈する
pub fn decode_number(bytes: &[u8], big_endian: bool) -> Result<i128, EvaluationErrorKind> {
    if bytes.len() > 16 {
        return Err(EvaluationErrorKind::TooWide(bytes.len()));
    }
    let mut value: u128 = 0;
    if big_endian {
        for &b in bytes {
            value = (value << 8) | b as u128;
        }
    } else {
        for &b in bytes.iter().rev() {
            value = (value << 8) | b as u128;
        }
    }
    i128::try_from(value).map_err(|_| EvaluationErrorKind::Arithmetic("value does not fit in 128 bits"))
}

/// 整数を `size` バイトにエンコードする（上位は切り捨て）
pub fn encode_number(value: i128, size: usize, big_endian: bool) -> Vec<u8> {
    let le = value.to_le_bytes();
    let mut bytes: Vec<u8> = (0..size)
        .map(|i| le.get(i).copied().unwrap_or(if value < 0 { 0xff } else { 0 }))
        .collect();
    if big_endian {
        bytes.reverse();
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_number_respects_endianness() {
        assert_eq!(decode_number(&[0x01, 0x02], false).unwrap(), 0x0201);
        assert_eq!(decode_number(&[0x01, 0x02], true).unwrap(), 0x0102);
        assert_eq!(decode_number(&[], false).unwrap(), 0);
        assert_eq!(decode_number(&[0; 17], false), Err(EvaluationErrorKind::TooWide(17)));
    }

    #[test]
    fn test_encode_number() {
        assert_eq!(encode_number(0x0102, 4, false), vec![0x02, 0x01, 0, 0]);
        assert_eq!(encode_number(0x0102, 2, true), vec![0x01, 0x02]);
        assert_eq!(encode_number(-1, 2, false), vec![0xff, 0xff]);
    }

    #[test]
    fn test_take_bytes() {
        assert_eq!(take_bytes(vec![1, 2, 3, 4], 2, false), Some(vec![1, 2]));
        assert_eq!(take_bytes(vec![1, 2, 3, 4], 2, true), Some(vec![3, 4]));
        assert_eq!(take_bytes(vec![1], 2, true), None);
    }
}
