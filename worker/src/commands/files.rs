//! `readFile` / `writeFile`: text file access sandboxed to a repository.
//!
//! ## Path validation
//!
//! `file_path` is resolved against `repo_path` (itself resolved against the
//! worker's current directory) and folded lexically. The result must be the
//! repository root itself or lie underneath it; anything else is rejected
//! before the filesystem is touched.
//!
//! ## Options
//!
//! - `nullIfNotExists` (read): reply `null` instead of failing on a missing file.
//! - `makeDirectory` (write): create parent directories first.

use std::path::{Path, PathBuf};

use serde_json::Value;

use super::{option_flag, required_str, CommandError};
use crate::util::{resolve_against, resolve_from_cwd};

/// Resolve `file` inside `repo`, rejecting anything that escapes it.
///
/// Containment is checked component-wise, so `/repo-other` is not inside
/// `/repo`.
pub fn resolve_in_repo(repo: &Path, file: &str) -> Result<PathBuf, CommandError> {
    let resolved = resolve_against(repo, Path::new(file));
    if resolved == repo || resolved.starts_with(repo) {
        Ok(resolved)
    } else {
        Err(CommandError::AccessDenied(resolved.display().to_string()))
    }
}

fn sandboxed_path(msg: &Value) -> Result<PathBuf, CommandError> {
    let repo = required_str(msg, "repo_path")?;
    let file = required_str(msg, "file_path")?;
    resolve_in_repo(&resolve_from_cwd(repo), file)
}

/// Handle a `readFile` envelope. Replies with the file's text (lossy UTF-8).
pub async fn read_file(msg: &Value) -> Result<Value, CommandError> {
    let path = sandboxed_path(msg)?;
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && option_flag(msg, "nullIfNotExists") => {
            Ok(Value::Null)
        }
        Err(e) => Err(io_error(&path, &e)),
    }
}

/// Handle a `writeFile` envelope. Overwrites any existing file.
pub async fn write_file(msg: &Value) -> Result<(), CommandError> {
    let path = sandboxed_path(msg)?;
    let content = msg
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| CommandError::Validation("content must be a string".to_string()))?;

    if option_flag(msg, "makeDirectory") {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, &e))?;
        }
    }
    tokio::fs::write(&path, content)
        .await
        .map_err(|e| io_error(&path, &e))
}

fn io_error(path: &Path, e: &std::io::Error) -> CommandError {
    match e.kind() {
        std::io::ErrorKind::NotFound => {
            CommandError::NotFound(format!("No such file or directory: {}", path.display()))
        }
        _ => CommandError::Io(std::io::Error::new(
            e.kind(),
            format!("{}: {e}", path.display()),
        )),
    }
}
