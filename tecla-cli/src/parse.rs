//! パース関連のユーティリティ関数

use anyhow::{anyhow, bail, Result};

/// アドレス文字列をu64にパース
///
/// 16進数（0xプレフィックス付き）または10進数をサポート
pub fn parse_address(s: &str) -> Result<u64> {
    let s = s.trim();

    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
            .map_err(|e| anyhow!("Invalid hexadecimal address '{}': {}", s, e))
    } else {
        s.parse::<u64>()
            .map_err(|e| anyhow!("Invalid address '{}': {}", s, e))
    }
}

/// 評価スタックに積む数値をパースする（負数と 16 進数を許す）
pub fn parse_number(s: &str) -> Result<i128> {
    let s = s.trim();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };

    let magnitude = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => i128::from_str_radix(hex, 16),
        None => digits.parse::<i128>(),
    }
    .map_err(|e| anyhow!("Invalid number '{}': {}", s, e))?;

    Ok(if negative { -magnitude } else { magnitude })
}

/// 16 進文字列をメモリ順のバイト列にパースする
///
/// `0x` プレフィックスは省略可能です。`0x0102` は `[0x01, 0x02]` になります。
pub fn parse_hex_bytes(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    let hex = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);

    if hex.is_empty() {
        bail!("Empty byte string");
    }
    if hex.len() % 2 != 0 {
        bail!("Odd number of hex digits in '{}'", s);
    }

    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| anyhow!("Invalid hex byte string '{}'", s))
        })
        .collect()
}

/// `KEY=VALUE` 形式の割り当てを分割する
pub fn split_assignment(s: &str) -> Result<(&str, &str)> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() && !value.is_empty() => Ok((key, value)),
        _ => bail!("Expected KEY=VALUE, got '{}'", s),
    }
}

/// バイト列を 16 進ダンプ用の文字列にする
pub fn format_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_hex() {
        assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
        assert_eq!(parse_address("0X7ff0").unwrap(), 0x7ff0);
        assert_eq!(parse_address("0xABCD").unwrap(), 0xabcd);
    }

    #[test]
    fn test_parse_address_dec() {
        assert_eq!(parse_address("1234").unwrap(), 1234);
        assert!(parse_address("xyz").is_err());
        assert!(parse_address("0xghij").is_err());
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("42").unwrap(), 42);
        assert_eq!(parse_number("-8").unwrap(), -8);
        assert_eq!(parse_number("0x10").unwrap(), 16);
        assert_eq!(parse_number("-0x10").unwrap(), -16);
        assert!(parse_number("ten").is_err());
    }

    #[test]
    fn test_parse_hex_bytes() {
        assert_eq!(parse_hex_bytes("0x0102ff").unwrap(), vec![0x01, 0x02, 0xff]);
        assert_eq!(parse_hex_bytes("f07f").unwrap(), vec![0xf0, 0x7f]);
        assert!(parse_hex_bytes("0x123").is_err());
        assert!(parse_hex_bytes("zz").is_err());
        assert!(parse_hex_bytes("").is_err());
    }

    #[test]
    fn test_split_assignment() {
        assert_eq!(split_assignment("0x1000=ff00").unwrap(), ("0x1000", "ff00"));
        assert_eq!(split_assignment("R0=01").unwrap(), ("R0", "01"));
        assert!(split_assignment("R0").is_err());
        assert!(split_assignment("=01").is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(&[0xf0, 0x7f, 0x00]), "f0 7f 00");
        assert_eq!(format_bytes(&[]), "");
    }
}
