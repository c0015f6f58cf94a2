//! Server command construction.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::port::LOOPBACK;

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Base command cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("Base command is empty after parsing")]
    EmptyCommand,
    #[error("Executable not found: {0}")]
    NotFound(String),
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Resolve the program to an absolute path.
    ///
    /// # Errors
    /// Returns error if the executable is not found.
    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), CommandBuildError> {
        let Self { program, args } = self;
        let executable = resolve_executable_path(&program)
            .await
            .ok_or(CommandBuildError::NotFound(program))?;
        Ok((executable, args))
    }
}

/// Builder for `<binary> serve --hostname <host> --port <port>`.
#[derive(Debug, Clone)]
pub struct ServeCommand {
    base: String,
    hostname: String,
    port: u16,
}

impl ServeCommand {
    /// `base` is split shell-style, so it may carry its own leading
    /// arguments (`"bunx opencode-ai"`).
    #[must_use]
    pub fn new(base: impl Into<String>, port: u16) -> Self {
        Self {
            base: base.into(),
            hostname: LOOPBACK.to_string(),
            port,
        }
    }

    /// Override the bind host.
    #[must_use]
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Build the argument vector.
    ///
    /// # Errors
    /// Returns error if the base command cannot be split or is empty.
    pub fn build(&self) -> Result<CommandParts, CommandBuildError> {
        let mut parts = shlex::split(&self.base)
            .ok_or_else(|| CommandBuildError::InvalidBase(self.base.clone()))?;
        if parts.is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }
        parts.extend([
            "serve".to_string(),
            "--hostname".to_string(),
            self.hostname.clone(),
            "--port".to_string(),
            self.port.to_string(),
        ]);

        let program = parts.remove(0);
        Ok(CommandParts {
            program,
            args: parts,
        })
    }
}

/// Resolve an executable by name through `PATH`, or accept an explicit path.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() && path.is_file() {
        return Some(path.to_path_buf());
    }

    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}
