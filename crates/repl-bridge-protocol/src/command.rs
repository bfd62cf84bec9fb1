//! Interpreter command lines.

use std::path::{Path, PathBuf};

use repl_bridge_core::{LaunchSpec, SessionContext};
use repl_bridge_pty::resolve_interpreter;
use thiserror::Error;

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Arguments cannot be parsed: {0}")]
    InvalidArgs(String),
    #[error("Executable not found: {0}")]
    NotFound(String),
}

/// Interpreter program, arguments and extra environment.
#[derive(Debug, Clone)]
pub struct InterpreterCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl InterpreterCommand {
    /// Create a command from a program name.
    #[must_use]
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Append arguments given as one shell-style line, e.g.
    /// `--vanilla --max-ppsize=100000`.
    ///
    /// # Errors
    /// Returns error if the line is malformed.
    pub fn args_line(self, line: &str) -> Result<Self, CommandBuildError> {
        Ok(self.args(split_command_line(line)?))
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I>(mut self, more: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.args.extend(more.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the interpreter.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Resolve the program and produce a launch spec for `ctx`.
    ///
    /// `explicit` overrides program discovery.
    ///
    /// # Errors
    /// Returns error if the executable cannot be found.
    pub async fn into_launch_spec(
        self,
        explicit: Option<&Path>,
        ctx: &SessionContext,
        cols: u16,
        rows: u16,
    ) -> Result<LaunchSpec, CommandBuildError> {
        let Self { program, args, env } = self;
        let resolved: PathBuf = resolve_interpreter(&program, explicit)
            .await
            .ok_or_else(|| {
                CommandBuildError::NotFound(
                    explicit.map_or_else(|| program.clone(), |p| p.display().to_string()),
                )
            })?;
        Ok(LaunchSpec {
            program: resolved,
            args,
            env,
            cwd: ctx.working_dir().to_path_buf(),
            cols,
            rows,
        })
    }
}

fn split_command_line(input: &str) -> Result<Vec<String>, CommandBuildError> {
    #[cfg(windows)]
    {
        Ok(winsplit::split(input))
    }

    #[cfg(not(windows))]
    {
        shlex::split(input).ok_or_else(|| CommandBuildError::InvalidArgs(input.to_string()))
    }
}
