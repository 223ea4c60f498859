//! Tecla CLI - コマンドラインインターフェース
//!
//! 位置式をオフラインで評価する `eval` と、静的ターゲットを組み立てながら
//! 評価できる REPL を提供します。

mod command;
mod parse;
mod session;

use anyhow::{anyhow, bail, Result};
use clap::{Args, Parser, Subcommand};
use command::Command;
use parse::{format_bytes, parse_address, parse_number};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use session::Session;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Tecla - location expression evaluator
#[derive(Parser)]
#[command(name = "tecla")]
#[command(version = "0.1.0")]
#[command(about = "Offline evaluator for remote-debugging location expressions", long_about = None)]
struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: TeclaCommand,
}

#[derive(Subcommand)]
enum TeclaCommand {
    /// Evaluate a JSON command list once
    Eval {
        /// Command list in wire form, e.g. '[[3], [1, -8], 5]'
        commands: String,

        #[command(flatten)]
        target: TargetArgs,

        /// Number of bytes to read from the result
        #[arg(long)]
        size: Option<usize>,
    },

    /// Start an interactive session
    Repl {
        #[command(flatten)]
        target: TargetArgs,
    },
}

/// 静的ターゲットと評価設定
#[derive(Args)]
struct TargetArgs {
    /// Frame base address
    #[arg(long)]
    fp: Option<String>,

    /// Evaluation argument (repeatable, ARG(0) first)
    #[arg(long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,

    /// Memory range as ADDR=HEX (repeatable)
    #[arg(long = "mem")]
    memory: Vec<String>,

    /// Register value as ID=HEX (repeatable)
    #[arg(long = "reg")]
    registers: Vec<String>,

    /// Interpret target values as big-endian
    #[arg(long)]
    big_endian: bool,

    /// Target address size in bytes
    #[arg(long, default_value_t = 8)]
    address_size: u8,
}

impl TargetArgs {
    fn into_session(self) -> Result<Session> {
        let mut session = Session::new();
        if let Some(fp) = &self.fp {
            session.set_frame_base(parse_address(fp)?);
        }
        for arg in &self.args {
            session.push_arg(parse_number(arg)?);
        }
        for spec in &self.memory {
            session.load_memory_spec(spec)?;
        }
        for spec in &self.registers {
            session.load_register_spec(spec)?;
        }
        session.set_big_endian(self.big_endian);
        session.set_address_size(self.address_size);
        Ok(session)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        TeclaCommand::Eval { commands, target, size } => {
            let mut session = target.into_session()?;
            handle_eval(&mut session, &commands, size)?;
        }
        TeclaCommand::Repl { target } => {
            println!("Tecla - location expression evaluator");
            println!("Version 0.1.0");
            println!();

            let mut session = target.into_session()?;
            run_repl(&mut session)?;
        }
    }

    Ok(())
}

/// ログ出力を初期化する（RUST_LOG があればそちらを優先）
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

/// 履歴ファイルのパス
fn history_path() -> Option<PathBuf> {
    home::home_dir().map(|dir| dir.join(".tecla_history"))
}

/// REPLループを実行する
fn run_repl(session: &mut Session) -> Result<()> {
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();

    let mut rl = DefaultEditor::new()?;
    let history = history_path();
    if let Some(path) = &history {
        // 初回起動時は履歴ファイルがない
        if let Err(e) = rl.load_history(path) {
            debug!("No history loaded from {}: {}", path.display(), e);
        }
    }

    loop {
        let readline = rl.readline("(tecla) ");
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;

                match Command::parse(line) {
                    Some(Command::Quit) => {
                        println!("Goodbye!");
                        break;
                    }
                    Some(command) => {
                        if let Err(e) = handle_command(session, command) {
                            eprintln!("Error: {}", e);
                        }
                    }
                    None => {
                        println!("Unknown command: {}", line);
                        println!("Type 'help' for available commands.");
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    if let Some(path) = &history {
        if let Err(e) = rl.save_history(path) {
            warn!("Failed to save history to {}: {}", path.display(), e);
        }
    }

    Ok(())
}

fn handle_command(session: &mut Session, command: Command) -> Result<()> {
    match command {
        Command::Help => print_help(),
        Command::Quit => {}
        Command::FrameBase(None) => match session.frame_base() {
            Some(fp) => println!("Frame base: 0x{:x}", fp),
            None => println!("Frame base is not set"),
        },
        Command::FrameBase(Some(value)) => {
            let fp = parse_address(&value)?;
            session.set_frame_base(fp);
            println!("Frame base set to 0x{:x}", fp);
        }
        Command::Arg(value) => {
            session.push_arg(parse_number(&value)?);
            println!("ARG({}) = {}", session.args().len() - 1, value);
        }
        Command::Args => print_args(session),
        Command::ClearArgs => {
            session.clear_args();
            println!("Arguments cleared");
        }
        Command::Memory(addr, bytes) => {
            session.load_memory_spec(&format!("{}={}", addr, bytes))?;
            println!("Memory added at {}", addr);
        }
        Command::Register(id, bytes) => {
            session.load_register_spec(&format!("{}={}", id, bytes))?;
            println!("Register {} set", id);
        }
        Command::Target => print_target(session),
        Command::Endian(None) => println!("{}", endian_name(session.big_endian())),
        Command::Endian(Some(value)) => {
            let big_endian = match value.as_str() {
                "big" | "be" => true,
                "little" | "le" => false,
                other => bail!("Unknown byte order '{}', expected big or little", other),
            };
            session.set_big_endian(big_endian);
            println!("Byte order set to {}", endian_name(big_endian));
        }
        Command::Eval(json) => handle_eval(session, &json, None)?,
        Command::Read(size) => {
            let size = usize::try_from(parse_address(&size)?)
                .map_err(|_| anyhow!("Read size '{}' is too large", size))?;
            let bytes = session.read_last(size)?;
            println!("{}", format_bytes(&bytes));
        }
    }

    Ok(())
}

/// Evalコマンドを処理する
///
/// # Arguments
/// * `size` - 結果から読むバイト数（省略時はアドレスサイズ）
fn handle_eval(session: &mut Session, json: &str, size: Option<usize>) -> Result<()> {
    let located = session.evaluate(json)?;
    println!("=> {}", located);

    let size = size.unwrap_or(session.address_size() as usize);
    match session.read_last(size) {
        Ok(bytes) => println!("{} bytes: {}", size, format_bytes(&bytes)),
        Err(e) => debug!("Result is not readable: {}", e),
    }
    Ok(())
}

fn endian_name(big_endian: bool) -> &'static str {
    if big_endian {
        "big-endian"
    } else {
        "little-endian"
    }
}

fn print_args(session: &Session) {
    if session.args().is_empty() {
        println!("No arguments");
        return;
    }
    for (i, arg) in session.args().iter().enumerate() {
        println!("  ARG({}) = {} (0x{:x})", i, arg, arg);
    }
}

fn print_target(session: &Session) {
    let target = session.target();

    println!("Memory:");
    for (addr, len) in target.memory_ranges() {
        println!("  0x{:x} ({} bytes)", addr, len);
    }

    println!("Registers:");
    let mut registers: Vec<_> = target.registers().collect();
    registers.sort_by_key(|(id, _)| *id);
    for (id, bytes) in registers {
        println!("  {} = {}", id, format_bytes(bytes));
    }
}

fn print_help() {
    println!("Available commands:");
    println!();
    println!("  help           - Show this help message");
    println!("  quit/exit/q    - Exit the session");
    println!();
    println!("Target commands:");
    println!("  fp [addr]        - Show or set the frame base");
    println!("  arg <n>          - Append an evaluation argument");
    println!("  args [clear]     - List or clear the arguments");
    println!("  mem <addr> <hex> - Add a memory range");
    println!("  reg <id> <hex>   - Set a register value");
    println!("  mem / reg        - Show memory ranges and registers");
    println!("  endian [big|little] - Show or set the byte order");
    println!();
    println!("Evaluation commands:");
    println!("  eval <json>    - Evaluate a command list");
    println!("  read <size>    - Read bytes at the last result");
    println!();
    println!("Examples:");
    println!("  fp 0x7ff0");
    println!("  mem 0x7fe8 efbeadde00000000");
    println!("  eval [[3], [1, -8], 5]");
    println!("  read 4");
}
