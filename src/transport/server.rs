//! Server session - spawns a remote `funcsync --server` and talks to it
//! over the child's stdin/stdout.
//!
//! The command is whatever reaches the target: `kubectl exec -i pod --
//! funcsync --server /app`, `ssh host funcsync --server /app`, or a local
//! `funcsync --server DIR`. Protocol handling is left to `send_files`.

use anyhow::{bail, Context, Result};
use std::ffi::OsStr;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncWriteExt, Join};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

/// Connection to the child's stdout (read side) and stdin (write side).
pub type ChildConnection = Join<ChildStdout, ChildStdin>;

/// Manages one spawned receiver process.
pub struct ServerSession {
    child: Child,
    conn: ChildConnection,
}

impl ServerSession {
    /// Spawn `argv[0]` with the remaining arguments.
    pub fn connect_command<S: AsRef<OsStr>>(argv: &[S]) -> Result<Self> {
        let Some((program, args)) = argv.split_first() else {
            bail!("Empty server command");
        };
        let mut cmd = Command::new(program);
        cmd.args(args);
        Self::spawn(cmd)
    }

    fn spawn(mut cmd: Command) -> Result<Self> {
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().context("Failed to spawn server process")?;
        let stdin = child.stdin.take().context("Failed to open stdin")?;
        let stdout = child.stdout.take().context("Failed to open stdout")?;
        tracing::debug!(pid = child.id(), "server process started");

        Ok(Self {
            child,
            conn: tokio::io::join(stdout, stdin),
        })
    }

    /// The byte stream to run a session over.
    pub fn connection(&mut self) -> &mut ChildConnection {
        &mut self.conn
    }

    /// Close the child's stdin and wait for it to exit.
    ///
    /// A non-zero status is returned rather than raised: the receiver
    /// reports per-file failures through its exit code.
    pub async fn finish(self) -> Result<ExitStatus> {
        let Self { mut child, conn } = self;
        let (stdout, mut stdin) = conn.into_inner();
        if let Err(e) = stdin.shutdown().await {
            tracing::debug!("Closing server stdin: {}", e);
        }
        drop(stdin);
        drop(stdout);

        let status = child.wait().await.context("Failed to wait for server")?;
        tracing::debug!(%status, "server process exited");
        Ok(status)
    }
}
