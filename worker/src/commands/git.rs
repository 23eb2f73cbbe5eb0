//! `gitCall`: run git inside a repository and return its stdout.
//!
//! A nonzero exit becomes an error carrying stdout+stderr verbatim. When that
//! text says the index lock is held (an editor refreshing the index in the
//! background, say), the call is retried with exponential backoff before the
//! failure is surfaced.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{required_str, CommandError};
use crate::config::GitConfig;
use crate::process::run_captured;
use crate::util::resolve_from_cwd;

/// Substring git prints when `.git/index.lock` already exists.
pub const INDEX_LOCK_MARKER: &str = "index.lock': File exists";

/// Handle a `gitCall` envelope.
pub async fn git_call(
    config: &GitConfig,
    msg: &Value,
    env: &HashMap<String, String>,
) -> Result<Value, CommandError> {
    let args = parse_args(msg)?;
    let repo = existing_repo(msg).await?;
    let stdout = run_with_lock_retry(config, &repo, &args, env).await?;
    Ok(Value::String(stdout))
}

fn parse_args(msg: &Value) -> Result<Vec<String>, CommandError> {
    let invalid = || CommandError::Validation("args must be an array of strings".to_string());
    msg.get("args")
        .and_then(Value::as_array)
        .ok_or_else(invalid)?
        .iter()
        .map(|a| a.as_str().map(str::to_string).ok_or_else(invalid))
        .collect()
}

/// Resolve `repo_path` and make sure it is an existing directory.
async fn existing_repo(msg: &Value) -> Result<PathBuf, CommandError> {
    let raw = required_str(msg, "repo_path")?;
    let resolved = resolve_from_cwd(raw);
    match tokio::fs::metadata(&resolved).await {
        Ok(meta) if meta.is_dir() => Ok(resolved),
        Ok(_) => Err(CommandError::NotFound(format!(
            "Repository path is not a directory: {}",
            resolved.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CommandError::NotFound(
            format!("Repository path does not exist: {}", resolved.display()),
        )),
        Err(e) => Err(e.into()),
    }
}

/// Run git, retrying while the index lock is held.
///
/// Makes at most `lock_retries + 1` attempts; the delay starts at
/// `lock_retry_delay_ms` and doubles after each retry.
pub async fn run_with_lock_retry(
    config: &GitConfig,
    repo: &Path,
    args: &[String],
    env: &HashMap<String, String>,
) -> Result<String, CommandError> {
    let mut delay = Duration::from_millis(config.lock_retry_delay_ms);
    let mut attempt = 0;
    loop {
        let mut cmd = Command::new(&config.program);
        cmd.args(args).current_dir(repo).envs(env);
        let out = run_captured(cmd, None).await?;
        if out.success() {
            return Ok(out.stdout);
        }

        let combined = out.combined();
        if combined.contains(INDEX_LOCK_MARKER) && attempt < config.lock_retries {
            attempt += 1;
            warn!(
                "git {} hit index lock in {}, retry {attempt}/{} in {}ms",
                args.first().map_or("", String::as_str),
                repo.display(),
                config.lock_retries,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
            delay = next_delay(delay);
            continue;
        }

        debug!("git exited {} in {}", out.exit_code, repo.display());
        return Err(CommandError::Process(combined));
    }
}

/// Double `delay`, saturating instead of overflowing on huge configured values.
fn next_delay(delay: Duration) -> Duration {
    delay.saturating_mul(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::os::unix::fs::PermissionsExt;

    fn fake_git(dir: &Path, body: &str) -> GitConfig {
        let path = dir.join("git");
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        GitConfig {
            program: path.to_string_lossy().into_owned(),
            lock_retries: 3,
            lock_retry_delay_ms: 1,
        }
    }

    /// Fails with the index-lock message `failures` times, then prints `ok`.
    fn flaky_git(dir: &Path, failures: u32) -> GitConfig {
        let d = dir.display();
        fake_git(
            dir,
            &format!(
                r#"n=$(cat {d}/attempts 2>/dev/null || echo 0)
n=$((n + 1))
echo $n > {d}/attempts
if [ $n -le {failures} ]; then
  echo "fatal: Unable to create '$PWD/.git/index.lock': File exists." >&2
  exit 128
fi
echo ok
"#
            ),
        )
    }

    fn attempts(dir: &Path) -> u32 {
        std::fs::read_to_string(dir.join("attempts"))
            .unwrap()
            .trim()
            .parse()
            .unwrap()
    }

    fn no_env() -> HashMap<String, String> {
        HashMap::new()
    }

    #[tokio::test]
    async fn args_must_be_strings() {
        let config = GitConfig::default();
        for msg in [
            json!({"repo_path": "/tmp"}),
            json!({"repo_path": "/tmp", "args": "status"}),
            json!({"repo_path": "/tmp", "args": ["status", 1]}),
        ] {
            let err = git_call(&config, &msg, &no_env()).await.unwrap_err();
            assert_eq!(err.to_string(), "args must be an array of strings");
        }
    }

    #[tokio::test]
    async fn repo_path_is_required() {
        let err = git_call(&GitConfig::default(), &json!({"args": []}), &no_env())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "repo_path must be a non-empty string");
    }

    #[tokio::test]
    async fn missing_repo_does_not_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let msg = json!({"repo_path": missing, "args": ["status"]});
        let err = git_call(&GitConfig::default(), &msg, &no_env())
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NotFound(_)));
        assert!(err.to_string().contains("does not exist"), "{err}");
    }

    #[tokio::test]
    async fn file_as_repo_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain.txt");
        std::fs::write(&file, "x").unwrap();
        let msg = json!({"repo_path": file, "args": ["status"]});
        let err = git_call(&GitConfig::default(), &msg, &no_env())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Repository path is not a directory"));
    }

    #[tokio::test]
    async fn runs_in_repo_and_passes_env() {
        let dir = tempfile::tempdir().unwrap();
        let config = fake_git(dir.path(), "pwd -P\necho \"$@\"\necho \"$SSH_AUTH_SOCK\"\n");
        let mut env = HashMap::new();
        env.insert("SSH_AUTH_SOCK".to_string(), "/tmp/agent.sock".to_string());

        let msg = json!({"repo_path": dir.path(), "args": ["log", "--oneline"]});
        let out = git_call(&config, &msg, &env).await.unwrap();
        let canonical = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(
            out,
            json!(format!("{}\nlog --oneline\n/tmp/agent.sock\n", canonical.display()))
        );
    }

    #[tokio::test]
    async fn failure_returns_combined_output() {
        let dir = tempfile::tempdir().unwrap();
        let config = fake_git(dir.path(), "echo partial\necho 'fatal: bad revision' >&2\nexit 128\n");
        let msg = json!({"repo_path": dir.path(), "args": ["show", "zzz"]});
        let err = git_call(&config, &msg, &no_env()).await.unwrap_err();
        assert_eq!(err.to_string(), "partial\nfatal: bad revision\n");
    }

    #[tokio::test]
    async fn lock_contention_is_retried_until_success() {
        let dir = tempfile::tempdir().unwrap();
        let config = flaky_git(dir.path(), 2);
        let msg = json!({"repo_path": dir.path(), "args": ["add", "-A"]});

        let out = git_call(&config, &msg, &no_env()).await.unwrap();
        assert_eq!(out, json!("ok\n"));
        assert_eq!(attempts(dir.path()), 3);
    }

    #[tokio::test]
    async fn lock_contention_gives_up_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let config = flaky_git(dir.path(), 100);
        let msg = json!({"repo_path": dir.path(), "args": ["add", "-A"]});

        let err = git_call(&config, &msg, &no_env()).await.unwrap_err();
        assert!(err.to_string().contains(INDEX_LOCK_MARKER), "{err}");
        assert_eq!(attempts(dir.path()), 4);
    }

    #[tokio::test]
    async fn other_failures_are_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let d = dir.path().display();
        let config = fake_git(
            dir.path(),
            &format!("echo x >> {d}/attempts.log\necho 'fatal: not a git repository' >&2\nexit 128\n"),
        );
        let msg = json!({"repo_path": dir.path(), "args": ["status"]});
        git_call(&config, &msg, &no_env()).await.unwrap_err();
        let log = std::fs::read_to_string(dir.path().join("attempts.log")).unwrap();
        assert_eq!(log.lines().count(), 1);
    }

    #[tokio::test]
    async fn status_porcelain_on_real_repo() {
        let has_git = std::process::Command::new("git")
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success());
        if !has_git {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let init = std::process::Command::new("git")
            .args(["init", "-q"])
            .current_dir(dir.path())
            .status()
            .unwrap();
        assert!(init.success());
        std::fs::write(dir.path().join("new.txt"), "hi\n").unwrap();

        let msg = json!({"repo_path": dir.path(), "args": ["status", "--porcelain"]});
        let out = git_call(&GitConfig::default(), &msg, &no_env())
            .await
            .unwrap();
        assert_eq!(out, json!("?? new.txt\n"));
    }

    #[test]
    fn retry_delay_doubles_and_saturates() {
        assert_eq!(next_delay(Duration::from_millis(100)), Duration::from_millis(200));
        assert_eq!(next_delay(Duration::MAX), Duration::MAX);
        let saturated = (0..64).fold(Duration::from_millis(u64::MAX), |d, _| next_delay(d));
        assert_eq!(saturated, Duration::MAX);
    }
}
