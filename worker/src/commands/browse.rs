//! `browseFiles`: list one directory level for the repository picker.

use std::path::Path;

use serde::Serialize;
use serde_json::Value;

use super::CommandError;
use crate::util::{expand_tilde, normalize};

#[derive(Debug, Serialize)]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "isDirectory")]
    pub is_directory: bool,
}

#[derive(Debug, Serialize)]
pub struct DirListing {
    pub path: String,
    pub entries: Vec<DirEntry>,
}

/// Handle a `browseFiles` envelope. `path` defaults to `/`.
pub async fn browse_files(msg: &Value) -> Result<Value, CommandError> {
    let raw = match msg.get("path") {
        None | Some(Value::Null) => "/",
        Some(Value::String(s)) if !s.is_empty() => s.as_str(),
        Some(_) => {
            return Err(CommandError::Validation(
                "path must be a non-empty string".to_string(),
            ))
        }
    };
    let expanded = expand_tilde(raw);
    let path = Path::new(expanded.as_ref());
    if !path.is_absolute() {
        return Err(CommandError::Validation("path must be absolute".to_string()));
    }
    let path = normalize(path);

    let listing = DirListing {
        path: path.display().to_string(),
        entries: list_dir(&path).await?,
    };
    serde_json::to_value(listing).map_err(|e| CommandError::Process(e.to_string()))
}

/// Immediate entries of `dir`, directories first, then by name.
///
/// Entries whose metadata cannot be read (broken symlinks, permission denied)
/// are still listed, as non-directories.
pub async fn list_dir(dir: &Path) -> Result<Vec<DirEntry>, CommandError> {
    let mut reader = tokio::fs::read_dir(dir).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            CommandError::NotFound(format!("No such file or directory: {}", dir.display()))
        }
        _ => CommandError::Io(e),
    })?;

    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        // Follows symlinks, so a link to a directory is browsable.
        let is_directory = tokio::fs::metadata(entry.path())
            .await
            .is_ok_and(|m| m.is_dir());
        entries.push(DirEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_directory,
        });
    }

    entries.sort_by(|a, b| {
        b.is_directory
            .cmp(&a.is_directory)
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn directories_first_then_by_name() {
        let dir = tempfile::tempdir().unwrap();
        for f in ["b.txt", "A.md", "c"] {
            std::fs::write(dir.path().join(f), "").unwrap();
        }
        for d in ["zeta", "alpha"] {
            std::fs::create_dir(dir.path().join(d)).unwrap();
        }

        let out = browse_files(&json!({"path": dir.path()})).await.unwrap();
        let names: Vec<(&str, bool)> = out["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| (e["name"].as_str().unwrap(), e["isDirectory"].as_bool().unwrap()))
            .collect();
        assert_eq!(
            names,
            vec![
                ("alpha", true),
                ("zeta", true),
                ("A.md", false),
                ("b.txt", false),
                ("c", false),
            ]
        );
        assert_eq!(out["path"], json!(dir.path().display().to_string()));
    }

    #[tokio::test]
    async fn broken_symlink_is_listed_as_file() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(dir.path().join("gone"), dir.path().join("dangling")).unwrap();
        std::fs::create_dir(dir.path().join("real")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("link")).unwrap();

        let entries = list_dir(dir.path()).await.unwrap();
        let find = |n: &str| entries.iter().find(|e| e.name == n).unwrap().is_directory;
        assert!(!find("dangling"));
        assert!(find("link"));
        assert!(find("real"));
    }

    #[tokio::test]
    async fn relative_path_is_rejected() {
        let err = browse_files(&json!({"path": "some/dir"})).await.unwrap_err();
        assert_eq!(err.to_string(), "path must be absolute");
    }

    #[tokio::test]
    async fn non_string_path_is_rejected() {
        let err = browse_files(&json!({"path": ""})).await.unwrap_err();
        assert_eq!(err.to_string(), "path must be a non-empty string");
        assert!(browse_files(&json!({"path": 7})).await.is_err());
    }

    #[tokio::test]
    async fn defaults_to_root() {
        let out = browse_files(&json!({})).await.unwrap();
        assert_eq!(out["path"], "/");
        assert!(out["entries"].as_array().is_some_and(|e| !e.is_empty()));
    }

    #[tokio::test]
    async fn missing_directory_is_not_found() {
        let err = browse_files(&json!({"path": "/nonexistent/gityak/dir"}))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NotFound(_)));
    }
}
