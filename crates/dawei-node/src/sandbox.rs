// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Constrained execution of user `!` commands.
//!
//! Commands are tokenized and executed argv-style — never through a shell —
//! and the binary must be on the configured allow-list.  Stdout and stderr
//! are truncated at 100 KB each.

use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// Output size cap per stream.
const MAX_OUTPUT_SIZE: usize = 100_000;
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub execution_time: Duration,
    pub cwd: String,
}

pub struct Sandbox {
    allowlist: Vec<String>,
}

impl Sandbox {
    pub fn new(allowlist: Vec<String>) -> Self {
        Self { allowlist }
    }

    /// Execute one command line inside `cwd`.
    pub async fn execute(&self, command_line: &str, cwd: &Path) -> anyhow::Result<CommandResult> {
        let argv = tokenize(command_line)?;
        let Some(program) = argv.first() else {
            anyhow::bail!("empty command");
        };
        // The allow-list is matched on the bare program name; paths are
        // rejected outright so the list cannot be sidestepped.
        if program.contains('/') || program.contains('\\') {
            anyhow::bail!("command paths are not allowed: {program}");
        }
        if !self.allowlist.iter().any(|allowed| allowed == program) {
            anyhow::bail!("command `{program}` is not on the allow-list");
        }

        info!(command = %command_line, cwd = %cwd.display(), "executing sandboxed command");
        let started = Instant::now();
        let output = tokio::time::timeout(
            COMMAND_TIMEOUT,
            tokio::process::Command::new(program)
                .args(&argv[1..])
                .current_dir(cwd)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("command timed out after {}s", COMMAND_TIMEOUT.as_secs()))??;

        let result = CommandResult {
            command: command_line.to_string(),
            stdout: truncate(String::from_utf8_lossy(&output.stdout).to_string()),
            stderr: truncate(String::from_utf8_lossy(&output.stderr).to_string()),
            exit_code: output.status.code().unwrap_or(-1),
            execution_time: started.elapsed(),
            cwd: cwd.display().to_string(),
        };
        if result.exit_code != 0 {
            warn!(command = %command_line, exit_code = result.exit_code, "command failed");
        }
        Ok(result)
    }
}

fn truncate(mut s: String) -> String {
    if s.len() > MAX_OUTPUT_SIZE {
        let mut cut = MAX_OUTPUT_SIZE;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push_str("\n... [output truncated at 100KB]");
    }
    s
}

/// Split a command line into argv, honoring single and double quotes.  No
/// variable expansion, no globbing, no redirection — those are shell
/// features and the shell is exactly what this avoids.
fn tokenize(line: &str) -> anyhow::Result<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;

    while let Some(c) = chars.next() {
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '\\' if !in_single => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if in_single || in_double {
        anyhow::bail!("unterminated quote in command");
    }
    if !current.is_empty() {
        args.push(current);
    }
    Ok(args)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
