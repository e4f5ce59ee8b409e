//! Command execution seam for build steps.
//!
//! Build steps that touch the host environment (package installs, identity
//! creation, ownership changes) go through the `CommandRunner` trait so the
//! pipeline can be exercised in tests without shelling out.

use std::fmt;
use std::process::{Command, Stdio};

/// An external command a build step wants executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<P, I, A>(program: P, args: I) -> Self
    where
        P: Into<String>,
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// A command could not be spawned or exited with a non-zero status.
#[derive(Debug, thiserror::Error)]
#[error("`{command}` failed: {reason}")]
pub struct CommandFailure {
    pub command: String,
    pub reason: String,
}

impl CommandFailure {
    fn new(spec: &CommandSpec, reason: impl Into<String>) -> Self {
        Self {
            command: spec.to_string(),
            reason: reason.into(),
        }
    }
}

/// Executes commands on behalf of build steps.
pub trait CommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<(), CommandFailure>;
}

/// Runner that spawns real processes, capturing output for error reporting.
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&self, spec: &CommandSpec) -> Result<(), CommandFailure> {
        tracing::debug!(command = %spec, "Running command");

        let output = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| CommandFailure::new(spec, e.to_string()))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.lines().last().unwrap_or("").trim();
        let reason = if detail.is_empty() {
            output.status.to_string()
        } else {
            format!("{} ({})", output.status, detail)
        };

        Err(CommandFailure::new(spec, reason))
    }
}
