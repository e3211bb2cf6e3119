//! Line-oriented control protocol on stdin.
//!
//! One command per line: `lock-read`, `unlock-read`, `lock-write`,
//! `unlock-write`, `status`, `quit`. Blank lines are ignored.

use anyhow::Result;
use stalltun_core::Tunnel;
use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    LockRead,
    UnlockRead,
    LockWrite,
    UnlockWrite,
    Status,
    Quit,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lock-read" => Ok(Command::LockRead),
            "unlock-read" => Ok(Command::UnlockRead),
            "lock-write" => Ok(Command::LockWrite),
            "unlock-write" => Ok(Command::UnlockWrite),
            "status" => Ok(Command::Status),
            "quit" | "exit" => Ok(Command::Quit),
            other => Err(format!("unknown command: {other}")),
        }
    }
}

/// Apply one command. Returns the line to print back, if any.
pub fn apply(tunnel: &Tunnel, command: Command) -> Result<Option<String>> {
    match command {
        Command::LockRead => tunnel.lock_read(),
        Command::UnlockRead => tunnel.unlock_read(),
        Command::LockWrite => tunnel.lock_write(),
        Command::UnlockWrite => tunnel.unlock_write(),
        Command::Status => return Ok(Some(serde_json::to_string(&tunnel.status())?)),
        Command::Quit => {}
    }
    Ok(None)
}

/// Read commands from `input` until `quit` or end of input.
pub async fn run<R, W>(tunnel: &Tunnel, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(e) => {
                warn!(line = %line.trim(), "ignoring control line");
                output.write_all(format!("error: {e}\n").as_bytes()).await?;
                output.flush().await?;
                continue;
            }
        };
        debug!(?command, "control command");
        if command == Command::Quit {
            break;
        }
        if let Some(reply) = apply(tunnel, command)? {
            output.write_all(reply.as_bytes()).await?;
            output.write_all(b"\n").await?;
        } else {
            output.write_all(b"ok\n").await?;
        }
        output.flush().await?;
    }
    Ok(())
}
