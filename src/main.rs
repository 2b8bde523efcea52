//! funcsync CLI
//!
//! Entry point for the `funcsync` command-line tool.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use funcsync::server::run_server;
use funcsync::transport::ServerSession;
use funcsync::{receive_files, send_files, DirEnumerator, SessionConfig, SessionReport};
use std::path::{Path, PathBuf};
use std::process::{ExitCode, ExitStatus};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

/// Exit code for a session that finished with per-file errors.
const EXIT_PARTIAL: u8 = 2;

#[derive(Parser)]
#[command(name = "funcsync")]
#[command(about = "Push function sources into a running target, sending only deltas", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Run as a stdio receiver rooted at ROOT (spawned by `send -- CMD`)
    #[arg(long, value_name = "ROOT")]
    server: Option<PathBuf>,

    /// Path to a TOML session config
    #[arg(long, short = 'c', global = true, env = "FUNCSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Concurrent transfer workers (default: CPU count + 1)
    #[arg(long, short = 'w', global = true, env = "FUNCSYNC_WORKERS")]
    workers: Option<usize>,

    /// Keep target entries that are not in the source tree
    #[arg(long, global = true)]
    no_delete: bool,

    /// Print the session report as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Push a directory to a receiver
    Send {
        /// Source directory
        source: PathBuf,

        /// Receiver address (host:port)
        #[arg(long, conflicts_with = "cmd", required_unless_present = "cmd")]
        connect: Option<String>,

        /// Command that starts a stdio receiver (after --)
        #[arg(last = true)]
        cmd: Vec<String>,
    },

    /// Receive a pushed directory
    Receive {
        /// Target directory
        root: PathBuf,

        /// Accept one sender on this address instead of using stdio
        #[arg(long)]
        listen: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    tokio::select! {
        result = run(cli) => match result {
            Ok(code) => code,
            Err(e) => {
                tracing::error!("{:#}", e);
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted");
            ExitCode::from(130)
        }
    }
}

/// Logs go to stderr: in stdio modes stdout belongs to the protocol.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("funcsync=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config = config.with_workers(workers);
    }
    if cli.no_delete {
        config.delete_extraneous = false;
    }
    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;

    if let Some(root) = &cli.server {
        let report = run_server(root, &config).await?;
        log_report(&report);
        return Ok(exit_code(&report));
    }

    let (report, stdout_free, peer_partial) = match &cli.command {
        Some(Commands::Send {
            source,
            connect,
            cmd,
        }) => {
            let (report, peer_partial) =
                run_send(source, connect.as_deref(), cmd, &config).await?;
            (report, true, peer_partial)
        }
        Some(Commands::Receive { root, listen }) => (
            run_receive(root, listen.as_deref(), &config).await?,
            listen.is_some(),
            false,
        ),
        None => bail!("No command given; see --help"),
    };

    if stdout_free {
        print_report(&report, cli.json)?;
    } else {
        log_report(&report);
    }
    if peer_partial {
        return Ok(ExitCode::from(EXIT_PARTIAL));
    }
    Ok(exit_code(&report))
}

/// Returns the report and whether a spawned receiver reported per-file
/// failures of its own.
async fn run_send(
    source: &Path,
    connect: Option<&str>,
    cmd: &[String],
    config: &SessionConfig,
) -> Result<(SessionReport, bool)> {
    let enumerator = DirEnumerator::new(source);

    if let Some(addr) = connect {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to {}", addr))?;
        stream.set_nodelay(true)?;
        tracing::info!("Connected to {}", addr);
        return Ok((send_files(stream, enumerator, config).await?, false));
    }

    let mut session = ServerSession::connect_command(cmd)?;
    let report = send_files(session.connection(), enumerator, config).await?;
    let peer_partial = server_partial(session.finish().await?)?;
    Ok((report, peer_partial))
}

/// Interpret the spawned receiver's exit status: `Ok(true)` when it
/// finished with per-file errors, an error for any other failure.
fn server_partial(status: ExitStatus) -> Result<bool> {
    if status.success() {
        return Ok(false);
    }
    if status.code() == Some(EXIT_PARTIAL as i32) {
        tracing::warn!("Receiver finished with per-file errors; see its log");
        return Ok(true);
    }
    bail!("Server process exited with {}", status)
}

async fn run_receive(
    root: &Path,
    listen: Option<&str>,
    config: &SessionConfig,
) -> Result<SessionReport> {
    let Some(addr) = listen else {
        return Ok(run_server(root, config).await?);
    };

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to listen on {}", addr))?;
    tracing::info!("Listening on {}", listener.local_addr()?);
    let (stream, peer) = listener.accept().await.context("Failed to accept")?;
    stream.set_nodelay(true)?;
    tracing::info!("Accepted sender {}", peer);

    Ok(receive_files(stream, root, config).await?)
}

fn exit_code(report: &SessionReport) -> ExitCode {
    if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_PARTIAL)
    }
}

fn log_report(report: &SessionReport) {
    tracing::info!(
        transferred = report.files_transferred(),
        skipped = report.files_skipped,
        deleted = report.files_deleted,
        errors = report.errors.len(),
        "session finished"
    );
}

fn print_report(report: &SessionReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!(
        "{} full, {} delta, {} metadata, {} skipped, {} deleted, {} literal bytes",
        report.files_full,
        report.files_delta,
        report.files_metadata,
        report.files_skipped,
        report.files_deleted,
        report.bytes_literal
    );
    for err in &report.errors {
        println!("  error: {}", err);
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn test_server_partial_exit_keeps_report() {
        assert!(!server_partial(ExitStatus::from_raw(0)).unwrap());
        assert!(server_partial(ExitStatus::from_raw(2 << 8)).unwrap());
        assert!(server_partial(ExitStatus::from_raw(1 << 8)).is_err());
        // Killed by SIGKILL
        assert!(server_partial(ExitStatus::from_raw(9)).is_err());
    }
}
