//! Staging of an isolated config root and the variables that point the
//! server at it.

use std::{
    ffi::OsString,
    io,
    path::{Component, Path, PathBuf},
};

use thiserror::Error;
use uuid::Uuid;

use crate::{config::VirtualFileSet, env::Environment};

/// Staged file exported as `OPENCODE_CONFIG` when present.
pub const CONFIG_FILE: &str = "config.json";

const ROOT_PREFIX: &str = "opencode_";

/// Staging error.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Invalid relative path in config set: {}", .0.display())]
    InvalidPath(PathBuf),
    #[error("Failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StageError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Write `files` into a new uniquely named directory below `base`.
///
/// Text files have `$VAR` / `${VAR}` references expanded against `env`;
/// unset variables expand to the empty string. Files that are not UTF-8 are
/// copied byte for byte. Either the whole set is staged or nothing is left
/// behind.
///
/// # Errors
/// Returns error if a path is not a plain relative path, or any directory or
/// file cannot be written.
pub async fn stage(
    files: &VirtualFileSet,
    env: &Environment,
    base: &Path,
) -> Result<PathBuf, StageError> {
    for (path, _) in files.iter() {
        if !is_plain_relative(path) {
            return Err(StageError::InvalidPath(path.to_path_buf()));
        }
    }

    tokio::fs::create_dir_all(base)
        .await
        .map_err(StageError::io(base))?;
    let root = base.join(format!("{ROOT_PREFIX}{}", Uuid::new_v4().simple()));
    tokio::fs::create_dir(&root)
        .await
        .map_err(StageError::io(&root))?;
    tracing::info!(path = %root.display(), "Created config directory");

    if let Err(e) = write_files(files, env, &root).await {
        if let Err(cleanup) = tokio::fs::remove_dir_all(&root).await {
            tracing::warn!(path = %root.display(), error = %cleanup, "Failed to remove partial config directory");
        }
        return Err(e);
    }

    tracing::info!(path = %root.display(), files = files.len(), "Config directory staged");
    Ok(root)
}

async fn write_files(
    files: &VirtualFileSet,
    env: &Environment,
    root: &Path,
) -> Result<(), StageError> {
    for (path, content) in files.iter() {
        let dest = root.join(path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(StageError::io(parent))?;
        }

        let written = match std::str::from_utf8(content) {
            Ok(text) => tokio::fs::write(&dest, expand(text, env)).await,
            Err(_) => {
                tracing::debug!(path = %path.display(), "Copying binary config file verbatim");
                tokio::fs::write(&dest, content).await
            }
        };
        written.map_err(StageError::io(&dest))?;
    }
    Ok(())
}

/// Expand environment references in `content` against `env`.
#[must_use]
pub fn expand(content: &str, env: &Environment) -> String {
    shellexpand::env_with_context_no_errors(content, |var: &str| {
        env.get(var).or_else(|| {
            tracing::warn!(variable = %var, "Environment variable not defined, using empty string");
            Some("")
        })
    })
    .into_owned()
}

fn is_plain_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)))
}

/// Variables that isolate the server inside `root` and hand it the
/// credential. With no root only the credential is set and the server sees
/// the ambient home and config.
#[must_use]
pub fn isolation_vars(
    root: Option<&Path>,
    config_file: Option<&Path>,
    api_key: Option<&str>,
) -> Vec<(&'static str, OsString)> {
    let mut vars = Vec::new();
    if let Some(root) = root {
        vars.push(("HOME", root.as_os_str().to_owned()));
        vars.push(("XDG_CONFIG_HOME", root.as_os_str().to_owned()));
        vars.push(("OPENCODE_CONFIG_DIR", root.as_os_str().to_owned()));
        if let Some(file) = config_file {
            vars.push(("OPENCODE_CONFIG", file.as_os_str().to_owned()));
        }
    }
    if let Some(key) = api_key {
        vars.push(("OPENCODE_API_KEY", OsString::from(key)));
    }
    vars
}
