//! Command shims for boot menu generator tests.
//!
//! Each binary in this crate shadows a system program on `PATH` while a test
//! runs. Most arguments are forwarded to the real program; a few invocations
//! are answered from the fixture environment so the generator sees the
//! provisioned state instead of the host's. Decisions live in this library so
//! they can be tested without spawning anything.
//!
//! Shims only write diagnostics to stderr: their stdout is the output the
//! generator parses.

use std::io::{self, BufRead, BufReader, Write};
use std::process::{Command, ExitStatus, Stdio};

use anyhow::{Context, Result};

pub mod date;
pub mod grub_probe;
pub mod mokutil;
pub mod zfs;
pub mod zpool;

/// A response a shim produces without consulting the real program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

impl Reply {
    /// Successful reply printing `stdout` followed by a newline.
    pub fn out(stdout: impl Into<String>) -> Self {
        Self {
            stdout: format!("{}\n", stdout.into()),
            stderr: String::new(),
            code: 0,
        }
    }

    /// Failing reply printing `stderr` followed by a newline.
    pub fn fail(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: format!("{}\n", stderr.into()),
            code,
        }
    }

    /// Failing reply printing `stderr` exactly as given.
    pub fn fail_raw(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            code,
        }
    }

    /// Successful reply with no output.
    pub fn silent() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            code: 0,
        }
    }

    /// Write the reply and return its exit code.
    pub fn emit(&self) -> i32 {
        print!("{}", self.stdout);
        eprint!("{}", self.stderr);
        let _ = io::stdout().flush();
        self.code
    }
}

/// What a shim does with one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Run the real program with these arguments.
    Forward(Vec<String>),
    /// Answer directly.
    Reply(Reply),
}

/// Arguments of the current process, program name excluded.
pub fn args() -> Vec<String> {
    std::env::args().skip(1).collect()
}

/// Run `program` with inherited stdio and return its exit code.
pub fn forward(program: &str, args: &[String]) -> Result<i32> {
    let status = Command::new(program)
        .args(args)
        .status()
        .with_context(|| format!("failed to run {}", program))?;
    Ok(exit_code(status))
}

/// Run `program`, passing each stdout line through `filter`.
pub fn forward_filtered<F>(program: &str, args: &[String], mut filter: F) -> Result<i32>
where
    F: FnMut(&str) -> String,
{
    let mut child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to run {}", program))?;

    let stdout = child.stdout.take().context("child stdout was not captured")?;
    let mut out = io::stdout().lock();
    for line in BufReader::new(stdout).lines() {
        let line = line.with_context(|| format!("failed to read output of {}", program))?;
        writeln!(out, "{}", filter(&line))?;
    }
    out.flush()?;

    let status = child
        .wait()
        .with_context(|| format!("failed to wait for {}", program))?;
    Ok(exit_code(status))
}

/// Carry out `decision` against `program` and return the exit code.
pub fn execute(program: &str, decision: Decision) -> Result<i32> {
    match decision {
        Decision::Forward(args) => forward(program, &args),
        Decision::Reply(reply) => Ok(reply.emit()),
    }
}

/// Entry point shared by the shim binaries: report errors on stderr and exit.
pub fn exit_with(result: Result<i32>) -> ! {
    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{:#}", e);
            std::process::exit(1)
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    // Killed by a signal: no code to propagate.
    status.code().unwrap_or(1)
}
