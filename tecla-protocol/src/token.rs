//! コマンドトークン

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

/// 払い出し済みのチャネルが無いことを表す番号
pub(crate) const NO_CHANNEL: u32 = 0;

/// チャネル番号の払い出し（プロセス全体で単調増加）
static NEXT_CHANNEL_ID: AtomicU32 = AtomicU32::new(1);

/// 新しいチャネル番号を払い出す
///
/// 番号を使い切った後は `None` を返し、番号を再利用しません。
pub(crate) fn next_channel_id() -> Option<u32> {
    NEXT_CHANNEL_ID
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| id.checked_add(1))
        .ok()
}

/// 送信中コマンドのトークン
///
/// 発行元チャネルの番号とチャネル内の連番の組です。どちらも切り詰めずに保持するため、
/// プロセスの生存期間中に同じ値が再利用されることはありません。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token {
    channel: u32,
    seq: u64,
}

impl Token {
    pub(crate) fn new(channel: u32, seq: u64) -> Self {
        Self { channel, seq }
    }

    /// 発行元チャネルの番号
    pub fn channel(self) -> u32 {
        self.channel
    }

    /// チャネル内の連番
    pub fn seq(self) -> u64 {
        self.seq
    }
}

/// 文字列形式は `<channel>.<seq>`
impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.channel, self.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseTokenError {
    #[error("token must have the form <channel>.<seq>")]
    Format,
    #[error("invalid token field: {0}")]
    Field(#[from] ParseIntError),
}

impl FromStr for Token {
    type Err = ParseTokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (channel, seq) = s.split_once('.').ok_or(ParseTokenError::Format)?;
        Ok(Token {
            channel: channel.parse()?,
            seq: seq.parse()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_parts() {
        let token = Token::new(3, 17);
        assert_eq!(token.channel(), 3);
        assert_eq!(token.seq(), 17);
        assert_eq!(token.to_string(), "3.17");
        assert_eq!(token.to_string().parse::<Token>().unwrap(), token);
    }

    #[test]
    fn test_large_channel_ids_are_not_truncated() {
        let token = Token::new(u32::MAX, u64::MAX);
        assert_eq!(token.channel(), u32::MAX);
        assert_eq!(token.seq(), u64::MAX);
        assert_ne!(token, Token::new(u32::MAX >> 8, u64::MAX));
        assert_eq!(token.to_string().parse::<Token>().unwrap(), token);
    }

    #[test]
    fn test_parse_rejects_malformed_tokens() {
        assert_eq!("17".parse::<Token>(), Err(ParseTokenError::Format));
        assert!(matches!("a.1".parse::<Token>(), Err(ParseTokenError::Field(_))));
        assert!("4294967296.0".parse::<Token>().is_err());
    }

    #[test]
    fn test_tokens_order_by_channel_then_seq() {
        assert!(Token::new(1, 5) < Token::new(1, 6));
        assert!(Token::new(1, 999) < Token::new(2, 0));
    }

    #[test]
    fn test_channel_ids_are_unique() {
        let a = next_channel_id().unwrap();
        let b = next_channel_id().unwrap();
        assert!(b > a);
        assert_ne!(a, NO_CHANNEL);
    }
}
