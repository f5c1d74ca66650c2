//! Version-control command runner
//!
//! Runs a single external command (normally `git`) in a working directory
//! and captures its output. A command that could not be started at all is
//! reported differently from one that ran and exited with a failure status.

use std::io;
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Errors produced by [`execute_command`]
#[derive(Error, Debug)]
pub enum CommandError {
    /// The process could not be spawned (missing binary, bad cwd, ...)
    #[error("Failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The process ran and exited unsuccessfully
    #[error("'{command}' exited with {}: {stderr}", status_label(.status))]
    Exit {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
}

impl CommandError {
    /// Standard error output of a failed process, if it ran at all
    pub fn stderr(&self) -> Option<&str> {
        match self {
            CommandError::Exit { stderr, .. } => Some(stderr),
            CommandError::Spawn { .. } => None,
        }
    }
}

fn status_label(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("status {}", code),
        None => "no status (terminated by signal)".to_string(),
    }
}

/// Output of a successful command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Execute `program` with `args`, optionally inside `cwd`
pub async fn execute_command(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
) -> Result<CommandOutput, CommandError> {
    let command_line = format!("{} {}", program, args.join(" "));
    debug!("Running: {} (cwd: {:?})", command_line, cwd);

    let mut command = Command::new(program);
    command.args(args);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let output = command.output().await.map_err(|source| CommandError::Spawn {
        command: command_line.clone(),
        source,
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        debug!("Failed: {} ({})", command_line, stderr.trim());
        return Err(CommandError::Exit {
            command: command_line,
            status: output.status.code(),
            stderr,
        });
    }

    Ok(CommandOutput { stdout, stderr })
}

/// Convenience wrapper for `git` commands
pub async fn git(args: &[&str], cwd: &Path) -> Result<CommandOutput, CommandError> {
    execute_command("git", args, Some(cwd)).await
}
