use std::process::{Command, Stdio};

use anyhow::Result;
use log::debug;

use crate::NbpError;

pub trait Executor {
    /// Runs `name` with `args` and returns the combined stdout/stderr.
    ///
    /// A non-zero exit is reported as `NbpError::Command` carrying the output.
    fn run(&self, name: &str, args: &[&str]) -> Result<String>;
}

impl<E: Executor + ?Sized> Executor for &E {
    fn run(&self, name: &str, args: &[&str]) -> Result<String> {
        (**self).run(name, args)
    }
}

impl<E: Executor + ?Sized> Executor for Box<E> {
    fn run(&self, name: &str, args: &[&str]) -> Result<String> {
        (**self).run(name, args)
    }
}

/// Runs commands on the local host.
#[derive(Debug, Default, Clone)]
pub struct HostExecutor;

impl HostExecutor {
    pub fn new() -> Self {
        HostExecutor
    }
}

impl Executor for HostExecutor {
    fn run(&self, name: &str, args: &[&str]) -> Result<String> {
        let line = redacted_line(name, args);
        debug!("Command: {}", line);

        let out = Command::new(name)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| NbpError::Spawn {
                cmd: name.to_string(),
                source,
            })?;

        let mut output = String::from_utf8_lossy(&out.stdout).to_string();
        output.push_str(&String::from_utf8_lossy(&out.stderr));

        if !out.status.success() {
            anyhow::bail!(NbpError::Command {
                cmd: line,
                status: out.status.code().unwrap_or(-1),
                output: output.trim().to_string(),
            })
        }

        Ok(output)
    }
}

pub(crate) fn command_line(name: &str, args: &[&str]) -> String {
    let mut line = name.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

// Masks the argument following a `node.session.auth.password` update.
pub(crate) fn redacted_line(name: &str, args: &[&str]) -> String {
    let mut masked = Vec::with_capacity(args.len());
    let mut hide = false;
    let mut seen_password = false;
    for arg in args {
        if hide {
            masked.push("***");
            hide = false;
            continue;
        }
        if arg.ends_with("auth.password") {
            seen_password = true;
        } else if seen_password && *arg == "--value" {
            hide = true;
            seen_password = false;
        }
        masked.push(*arg);
    }
    command_line(name, &masked)
}
