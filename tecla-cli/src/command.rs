//! REPL コマンド

/// REPL コマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// フレームベースを表示（引数なし）または設定
    FrameBase(Option<String>),
    /// 評価引数を末尾に追加
    Arg(String),
    /// 評価引数を表示
    Args,
    /// 評価引数を全て消去
    ClearArgs,
    /// メモリ範囲を追加: アドレスと 16 進バイト列
    Memory(String, String),
    /// メモリ範囲とレジスタを表示
    Target,
    /// レジスタ値を設定: ID と 16 進バイト列
    Register(String, String),
    /// バイトオーダーを表示（引数なし）または設定
    Endian(Option<String>),
    /// JSON のコマンド列を評価
    Eval(String),
    /// 直前の評価結果が示すバイト列を読む
    Read(String),
    /// ヘルプ表示
    Help,
    /// 終了
    Quit,
}

impl Command {
    /// コマンド文字列をパースする
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let (head, rest) = match input.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (input, ""),
        };
        let parts: Vec<&str> = rest.split_whitespace().collect();

        match head {
            "fp" => Some(Command::FrameBase(parts.first().map(|s| s.to_string()))),
            "arg" | "a" => parts.first().map(|s| Command::Arg(s.to_string())),
            "args" => match parts.first() {
                None => Some(Command::Args),
                Some(&"clear") => Some(Command::ClearArgs),
                Some(_) => None,
            },
            "mem" | "m" => match parts.as_slice() {
                [addr, bytes] => Some(Command::Memory(addr.to_string(), bytes.to_string())),
                [] => Some(Command::Target),
                _ => None,
            },
            "reg" | "r" => match parts.as_slice() {
                [id, bytes] => Some(Command::Register(id.to_string(), bytes.to_string())),
                [] => Some(Command::Target),
                _ => None,
            },
            "endian" => Some(Command::Endian(parts.first().map(|s| s.to_string()))),
            // JSON は空白を含むので残り全体を渡す
            "eval" | "e" if !rest.is_empty() => Some(Command::Eval(rest.to_string())),
            "read" => parts.first().map(|s| Command::Read(s.to_string())),
            "help" | "h" | "?" => Some(Command::Help),
            "quit" | "q" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("fp"), Some(Command::FrameBase(None)));
        assert_eq!(
            Command::parse("fp 0x7ff0"),
            Some(Command::FrameBase(Some("0x7ff0".to_string())))
        );
        assert_eq!(Command::parse("arg -4"), Some(Command::Arg("-4".to_string())));
        assert_eq!(Command::parse("args"), Some(Command::Args));
        assert_eq!(Command::parse("args clear"), Some(Command::ClearArgs));
        assert_eq!(
            Command::parse("mem 0x1000 e87f0000"),
            Some(Command::Memory("0x1000".to_string(), "e87f0000".to_string()))
        );
        assert_eq!(Command::parse("reg"), Some(Command::Target));
        assert_eq!(
            Command::parse("reg R0 01"),
            Some(Command::Register("R0".to_string(), "01".to_string()))
        );
        assert_eq!(Command::parse("endian big"), Some(Command::Endian(Some("big".to_string()))));
        assert_eq!(Command::parse("read 8"), Some(Command::Read("8".to_string())));
        assert_eq!(Command::parse("help"), Some(Command::Help));
        assert_eq!(Command::parse("q"), Some(Command::Quit));
    }

    #[test]
    fn test_parse_eval_keeps_whitespace() {
        assert_eq!(
            Command::parse("eval [[3], [1, 8], 5]"),
            Some(Command::Eval("[[3], [1, 8], 5]".to_string()))
        );
    }

    #[test]
    fn test_parse_invalid_commands() {
        assert_eq!(Command::parse(""), None);
        assert_eq!(Command::parse("eval"), None);
        assert_eq!(Command::parse("arg"), None);
        assert_eq!(Command::parse("mem 0x1000"), None);
        assert_eq!(Command::parse("args foo"), None);
        assert_eq!(Command::parse("unknown"), None);
    }
}
