use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use gdbclient::parser::{decode_hex, encode_hex};
use gdbclient::{
    parse_address, BreakpointKind, ClientConfig, ExecutionState, GdbClient, GdbError, Result,
};
use serde::Serialize;

mod formatting;
mod screen;

use formatting::{exit_code, format_registers, hexdump};

#[derive(Parser, Debug)]
#[command(
    name = "dbxdebug",
    version,
    about = "Remote debugger for DOS programs running in DOSBox-X"
)]
struct Cli {
    /// Log progress messages
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log every packet exchanged with the debug stub
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct Target {
    /// Debug stub host
    #[arg(long, default_value = gdbclient::DEFAULT_HOST)]
    host: String,

    /// Debug stub port
    #[arg(long, default_value_t = gdbclient::DEFAULT_PORT)]
    port: u16,

    /// Seconds to wait for each reply
    #[arg(long, default_value_t = 5.0)]
    timeout: f64,

    /// Print results as JSON
    #[arg(long)]
    json: bool,
}

impl Target {
    fn config(&self) -> Result<ClientConfig> {
        let timeout = parse_seconds("timeout", self.timeout)?;
        Ok(ClientConfig::new(self.host.clone(), self.port).with_response_timeout(timeout))
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Memory, register, breakpoint and execution commands
    Gdb {
        #[command(flatten)]
        target: Target,
        #[command(subcommand)]
        command: GdbCommand,
    },
    /// Text screen capture
    Screen {
        #[command(flatten)]
        target: Target,
        #[command(subcommand)]
        command: ScreenCommand,
    },
}

#[derive(Subcommand, Debug)]
enum GdbCommand {
    /// Read memory; ADDRESS is SSSS:OOOO, 0x-hex or bare hex
    ReadMem {
        address: String,
        /// Byte count, decimal or 0x-hex
        length: String,
        /// Print a hex dump instead of raw bytes
        #[arg(long)]
        hex: bool,
    },
    /// Write hex-encoded bytes, e.g. `deadbeef`
    WriteMem { address: String, data: String },
    /// Show CPU registers
    Registers,
    /// Set a breakpoint that stays in place after this command exits
    Break {
        address: String,
        #[arg(long)]
        hardware: bool,
    },
    /// Remove a breakpoint set by `break`
    Delete {
        address: String,
        #[arg(long)]
        hardware: bool,
    },
    /// Execute one instruction
    Step,
    /// Resume until the next stop (Ctrl+C interrupts)
    Continue,
    /// Send a raw `q` query, e.g. `Supported` or `C`
    Query { key: String },
    /// Report why the target is stopped
    HaltReason,
}

#[derive(Subcommand, Debug)]
enum ScreenCommand {
    /// Print the 80x25 text screen
    Dump {
        /// Write raw character/attribute bytes instead
        #[arg(long)]
        raw: bool,
    },
    /// Save the screen as an HTML page with its colours
    Html {
        #[arg(short, long, default_value = "screen.html")]
        output: PathBuf,
    },
    /// Redraw the screen and BIOS tick count until Ctrl+C
    Watch {
        /// Seconds between refreshes
        #[arg(long, default_value_t = 0.5)]
        interval: f64,
    },
}

const CLEAR_TERMINAL: &str = "\x1b[2J\x1b[H";

fn parse_seconds(name: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| GdbError::Format(format!("invalid {} {}: {}", name, value, e)))
}

fn parse_length(text: &str) -> Result<usize> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|_| GdbError::Format(format!("invalid length '{}'", text)))
}

fn breakpoint_kind(hardware: bool) -> BreakpointKind {
    if hardware {
        BreakpointKind::Hardware
    } else {
        BreakpointKind::Software
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).map_err(|e| GdbError::Format(e.to_string()))?;
    println!("{}", text);
    Ok(())
}

fn write_raw(data: &[u8]) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(data)?;
    stdout.flush()?;
    Ok(())
}

async fn run_gdb(client: &mut GdbClient, command: GdbCommand, json: bool) -> Result<()> {
    match command {
        GdbCommand::ReadMem { address, length, hex } => {
            let linear = parse_address(&address)?;
            let data = client.read_memory(linear, parse_length(&length)?).await?;
            if json {
                let value = serde_json::json!({ "address": linear, "data": encode_hex(&data) });
                print_json(&value)?;
            } else if hex {
                for line in hexdump(&data, linear) {
                    println!("{}", line);
                }
            } else {
                write_raw(&data)?;
            }
        }
        GdbCommand::WriteMem { address, data } => {
            let linear = parse_address(&address)?;
            let bytes = decode_hex(&data)
                .map_err(|_| GdbError::Format(format!("invalid hex data '{}'", data)))?;
            client.write_memory(linear, &bytes).await?;
            println!("Wrote {} bytes to {}", bytes.len(), address);
        }
        GdbCommand::Registers => {
            let registers = client.read_registers().await?;
            if json {
                print_json(&registers)?;
            } else {
                for line in format_registers(&registers) {
                    println!("{}", line);
                }
            }
        }
        GdbCommand::Break { address, hardware } => {
            let linear = parse_address(&address)?;
            client.set_breakpoint(linear, breakpoint_kind(hardware)).await?;
            client.release_breakpoints();
            println!("Breakpoint set at {}", address);
        }
        GdbCommand::Delete { address, hardware } => {
            let linear = parse_address(&address)?;
            client.adopt_breakpoint(linear, breakpoint_kind(hardware));
            let result = client.clear_breakpoint(linear).await;
            client.release_breakpoints();
            result?;
            println!("Breakpoint removed at {}", address);
        }
        GdbCommand::Step => {
            let timeout = client.config().response_timeout();
            let cause = client.step(Some(timeout)).await?;
            if json {
                print_json(&cause)?;
            } else {
                println!("Stopped: {}", cause);
            }
        }
        GdbCommand::Continue => {
            eprintln!("Continuing... (Ctrl+C to interrupt)");
            let outcome = tokio::select! {
                result = client.continue_execution(None) => Some(result),
                _ = tokio::signal::ctrl_c() => None,
            };
            let cause = match outcome {
                Some(result) => result?,
                None => {
                    eprintln!("Interrupting");
                    let timeout = client.config().response_timeout();
                    client.interrupt(Some(timeout)).await?
                }
            };
            if json {
                print_json(&cause)?;
            } else {
                println!("Stopped: {}", cause);
            }
        }
        GdbCommand::Query { key } => match client.query(&key).await? {
            Some(reply) => println!("{}", reply),
            None => return Err(GdbError::Unsupported(key)),
        },
        GdbCommand::HaltReason => {
            let reply = client.halt_reason().await?;
            if json {
                print_json(&reply)?;
            } else if let ExecutionState::Stopped(cause) = client.state() {
                println!("Stopped: {}", cause);
            }
        }
    }
    Ok(())
}

async fn run_screen(client: &mut GdbClient, command: ScreenCommand, json: bool) -> Result<()> {
    match command {
        ScreenCommand::Dump { raw } => {
            let data = client.read_memory(screen::TEXT_BASE, screen::SCREEN_BYTES).await?;
            if raw {
                write_raw(&data)?;
            } else if json {
                print_json(&screen::text_lines(&data))?;
            } else {
                for line in screen::text_lines(&data) {
                    println!("{}", line);
                }
            }
        }
        ScreenCommand::Html { output } => {
            let data = client.read_memory(screen::TEXT_BASE, screen::SCREEN_BYTES).await?;
            tokio::fs::write(&output, screen::to_html(&data)).await?;
            if json {
                print_json(&serde_json::json!({ "output": output }))?;
            } else {
                println!("Saved to {}", output.display());
            }
        }
        ScreenCommand::Watch { interval } => {
            let interval = parse_seconds("interval", interval)?;
            eprintln!("Watching screen... (Ctrl+C to stop)");
            tokio::select! {
                result = watch_screen(client, interval) => result?,
                _ = tokio::signal::ctrl_c() => eprintln!("\nStopped"),
            }
        }
    }
    Ok(())
}

/// Redraw the text screen every `interval` until the session needs recovery
async fn watch_screen(client: &mut GdbClient, interval: Duration) -> Result<()> {
    loop {
        let mut frame = String::from(CLEAR_TERMINAL);
        match client.read_memory(screen::TEXT_BASE, screen::SCREEN_BYTES).await {
            Ok(data) => {
                for line in screen::text_lines(&data) {
                    frame.push_str(&line);
                    frame.push('\n');
                }
                match client.read_memory(screen::BDA_TIMER_TICKS, 4).await {
                    Ok(bytes) => {
                        if let Some(ticks) = screen::tick_count(&bytes) {
                            frame.push_str(&format!("\nTicks: {}\n", ticks));
                        }
                    }
                    Err(e) if e.needs_recovery() => return Err(e),
                    Err(e) => log::debug!("Tick counter unavailable: {}", e),
                }
            }
            Err(e) if e.needs_recovery() => return Err(e),
            Err(e) => {
                log::warn!("Screen read failed: {}", e);
                frame.push_str("Failed to read screen\n");
            }
        }
        write_raw(frame.as_bytes())?;
        tokio::time::sleep(interval).await;
    }
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Gdb { target, command } => {
            let mut client = GdbClient::connect(target.config()?).await?;
            let result = run_gdb(&mut client, command, target.json).await;
            client.close().await;
            result
        }
        Command::Screen { target, command } => {
            let mut client = GdbClient::connect(target.config()?).await?;
            let result = run_screen(&mut client, command, target.json).await;
            client.close().await;
            result
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.debug {
        log::LevelFilter::Debug
    } else if cli.verbose {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };
    if let Err(e) = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .with_module_level("gdbclient", level)
        .with_module_level("dbxdebug", level)
        .init()
    {
        eprintln!("Failed to initialise logging: {}", e);
    }

    log::info!("dbxdebug starting...");

    if let Err(e) = run(cli.command).await {
        eprintln!("Error: {}", e);
        std::process::exit(exit_code(&e));
    }
}
