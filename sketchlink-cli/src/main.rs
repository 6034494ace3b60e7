//! sketchlink CLI - upload Arduino sketches to remote devices.
//!
//! ## Features
//!
//! - Upload Intel HEX sketches over a serial bridge or a Wi-Fi (TCP) bridge
//! - Inspect how a sketch will be paged without touching any device
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(true);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(std::sync::atomic::Ordering::Relaxed) && console::colors_enabled_stderr()
}

mod commands;
mod config;

use commands::{completions::cmd_completions, info::cmd_info, upload::cmd_upload};
use config::{Config, TransportKind};

/// sketchlink - upload Arduino sketches over serial and Wi-Fi bridges.
///
/// Environment variables:
///   SKETCHLINK_TRANSPORT   - Default transport (serial, tcp)
///   SKETCHLINK_PORT        - Default serial port
///   SKETCHLINK_BAUD        - Default baud rate (default: 19200)
///   SKETCHLINK_HOST        - Default bridge host
///   SKETCHLINK_TCP_PORT    - Default bridge TCP port (default: 1111)
///   SKETCHLINK_PAGE_SIZE   - Default page size
///   SKETCHLINK_RETRIES     - Default attempts per packet
#[derive(Parser)]
#[command(name = "sketchlink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Upload a sketch to a remote device.
    Upload(UploadArgs),

    /// Show how a sketch will be paged, without any device I/O.
    Info {
        /// Path to the Intel HEX sketch.
        sketch: PathBuf,

        /// Data bytes per page.
        #[arg(long, env = "SKETCHLINK_PAGE_SIZE")]
        page_size: Option<usize>,

        /// Reject records with bad checksums.
        #[arg(long)]
        strict_checksum: bool,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Options of the upload command. Unset options fall back to the config
/// files, then to built-in defaults.
#[derive(Args, Debug)]
struct UploadArgs {
    /// Path to the Intel HEX sketch.
    sketch: PathBuf,

    /// Bridge type.
    #[arg(short, long, value_enum, env = "SKETCHLINK_TRANSPORT")]
    transport: Option<TransportKind>,

    /// Serial port of the bridge (serial transport).
    #[arg(short, long, env = "SKETCHLINK_PORT")]
    port: Option<String>,

    /// Serial baud rate (serial transport).
    #[arg(short, long, env = "SKETCHLINK_BAUD")]
    baud: Option<u32>,

    /// Bridge host name or address (tcp transport).
    #[arg(long, env = "SKETCHLINK_HOST")]
    host: Option<String>,

    /// Bridge TCP port (tcp transport).
    #[arg(long, env = "SKETCHLINK_TCP_PORT")]
    tcp_port: Option<u16>,

    /// TCP connect timeout in seconds.
    #[arg(long, value_name = "SECS")]
    connect_timeout_s: Option<u64>,

    /// Data bytes per page (defaults to what the bridge can carry).
    #[arg(long, env = "SKETCHLINK_PAGE_SIZE")]
    page_size: Option<usize>,

    /// How long to wait for each ACK.
    #[arg(long, value_name = "MS")]
    ack_timeout_ms: Option<u64>,

    /// Timeout the bootloader applies between packets.
    #[arg(long, value_name = "SECS", visible_alias = "arduino-timeout-s")]
    device_timeout_s: Option<u8>,

    /// Attempts per packet before giving up.
    #[arg(long, env = "SKETCHLINK_RETRIES")]
    retries: Option<u32>,

    /// Pause between attempts.
    #[arg(long, value_name = "MS")]
    retry_delay_ms: Option<u64>,

    /// Reject hex records with bad checksums.
    #[arg(long)]
    strict_checksum: bool,
}

/// Errors raised by the CLI itself, each with its own exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Missing or contradictory options.
    #[error("{0}")]
    Usage(String),
    /// Settings that cannot be turned into a valid upload.
    #[error("{0}")]
    Config(String),
    /// Interrupted by the user.
    #[error("{0}")]
    Cancelled(String),
}

/// Exit code for a failed command.
///
/// 1 generic, 2 usage, 3 configuration, 4 transport could not be opened,
/// 5 device needs a fresh upload, 130 cancelled.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Config(_) => 3,
            CliError::Cancelled(_) => 130,
        };
    }

    match err
        .chain()
        .find_map(|cause| cause.downcast_ref::<sketchlink::Error>())
    {
        Some(sketchlink::Error::InvalidPageSize(_)) => 2,
        Some(sketchlink::Error::Config(_)) => 3,
        Some(sketchlink::Error::TransportOpen { .. }) => 4,
        Some(sketchlink::Error::DeviceResyncRequired(_)) => 5,
        Some(sketchlink::Error::Cancelled) => 130,
        _ => 1,
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let log_level = if quiet {
        "warn"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(verbose >= 2)
        .format_timestamp(if verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn main() -> ExitCode {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, std::sync::atomic::Ordering::Relaxed);

    if env::var_os("NO_COLOR").is_some() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    debug!(
        "sketchlink v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = exit_code_for(&err);
            eprintln!("{} {err:#}", style("Error:").red().bold());
            if code == 5 {
                eprintln!(
                    "{} The device lost track of the upload; run the upload again.",
                    style("hint:").yellow()
                );
            }
            ExitCode::from(code)
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Upload(args) => cmd_upload(cli, &config, args),
        Commands::Info {
            sketch,
            page_size,
            strict_checksum,
            json,
        } => cmd_info(&config, sketch, *page_size, *strict_checksum, *json),
        Commands::Completions { shell } => {
            cmd_completions(*shell);
            Ok(())
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use sketchlink::ReplyCode;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_upload_args_parse() {
        let cli = Cli::try_parse_from([
            "sketchlink",
            "-vv",
            "upload",
            "Blink.cpp.hex",
            "--transport",
            "tcp",
            "--host",
            "192.168.1.115",
            "--arduino-timeout-s",
            "5",
            "--retries",
            "3",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        let Commands::Upload(args) = cli.command else {
            panic!("expected upload");
        };
        assert_eq!(args.sketch, PathBuf::from("Blink.cpp.hex"));
        assert_eq!(args.transport, Some(TransportKind::Tcp));
        assert_eq!(args.host.as_deref(), Some("192.168.1.115"));
        assert_eq!(args.device_timeout_s, Some(5));
        assert_eq!(args.retries, Some(3));
        assert!(!args.strict_checksum);
    }

    #[test]
    fn test_upload_requires_sketch() {
        assert!(Cli::try_parse_from(["sketchlink", "upload"]).is_err());
    }

    #[test]
    fn test_exit_code_for_cli_errors() {
        assert_eq!(exit_code_for(&CliError::Usage("x".into()).into()), 2);
        assert_eq!(exit_code_for(&CliError::Config("x".into()).into()), 3);
        assert_eq!(exit_code_for(&CliError::Cancelled("x".into()).into()), 130);
    }

    #[test]
    fn test_exit_code_for_library_errors() {
        let open = sketchlink::Error::TransportOpen {
            transport: "COM3".into(),
            reason: "busy".into(),
        };
        assert_eq!(exit_code_for(&open.into()), 4);

        let resync = sketchlink::Error::DeviceResyncRequired(ReplyCode::StartOver);
        assert_eq!(exit_code_for(&resync.into()), 5);

        assert_eq!(exit_code_for(&sketchlink::Error::Cancelled.into()), 130);
        assert_eq!(exit_code_for(&sketchlink::Error::EmptyProgram.into()), 1);
    }

    #[test]
    fn test_exit_code_looks_through_context() {
        let err = anyhow::Error::new(sketchlink::Error::TransportOpen {
            transport: "bridge:1111".into(),
            reason: "refused".into(),
        })
        .context("Upload failed");
        assert_eq!(exit_code_for(&err), 4);
    }
}
