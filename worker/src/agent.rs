//! Per-connection ssh-agent sessions.
//!
//! A client may hand the worker a private key (`sshAgentInit`) so that git
//! operations needing SSH auth (fetch, push against an SSH remote) work without
//! the key ever touching disk. Each WebSocket connection gets at most one
//! agent; the table is keyed by [`ConnectionId`], so closing one connection
//! can never tear down another's agent.

use std::collections::HashMap;
use std::sync::Arc;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::process::{run_captured, ProcessError};

/// Opaque identity of one accepted WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A live agent process and the socket it listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSession {
    pub auth_sock: String,
    pub agent_pid: i32,
}

#[derive(Debug)]
pub enum AgentError {
    /// `ssh-agent` ran but its output did not name a socket and pid.
    StartFailed,
    /// `ssh-add` rejected the key.
    AddFailed { exit_code: i32, stderr: String },
    /// Another live session already owns this socket path.
    SocketInUse(String),
    Process(ProcessError),
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentError::StartFailed => write!(f, "Failed to start ssh-agent"),
            AgentError::AddFailed { exit_code, stderr } => {
                write!(f, "ssh-add failed (exit {exit_code}): {}", stderr.trim())
            }
            AgentError::SocketInUse(path) => write!(f, "Agent socket already in use: {path}"),
            AgentError::Process(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for AgentError {}

impl From<ProcessError> for AgentError {
    fn from(e: ProcessError) -> Self {
        AgentError::Process(e)
    }
}

/// Table of agent sessions, shared by every connection of one worker.
#[derive(Clone)]
pub struct AgentSessions {
    inner: Arc<Mutex<HashMap<ConnectionId, AgentSession>>>,
    agent_program: String,
    add_program: String,
}

impl AgentSessions {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            agent_program: config.agent_program.clone(),
            add_program: config.add_program.clone(),
        }
    }

    /// Start a fresh agent for `conn` and load `private_key` into it.
    ///
    /// Any agent previously held by `conn` is destroyed first. If the key
    /// cannot be loaded, the new agent is killed before the error returns.
    /// Dropping the future before it completes also kills the new agent.
    pub async fn init_agent(
        &self,
        conn: ConnectionId,
        private_key: &str,
    ) -> Result<AgentSession, AgentError> {
        self.destroy_agent(conn).await;

        let mut cmd = Command::new(&self.agent_program);
        cmd.arg("-s");
        let out = run_captured(cmd, None).await?;
        let session = parse_agent_output(&out.stdout).ok_or(AgentError::StartFailed)?;
        debug!(
            "Started ssh-agent pid={} sock={} for {conn}",
            session.agent_pid, session.auth_sock
        );
        let pending = PendingAgent::new(self.clone(), session.clone());

        let mut key = private_key.trim_end().to_string();
        key.push('\n');
        let mut add = Command::new(&self.add_program);
        add.arg("-").env("SSH_AUTH_SOCK", &session.auth_sock);
        let added = match run_captured(add, Some(key.as_bytes())).await {
            Ok(out) => out,
            Err(e) => {
                pending.kill().await;
                return Err(e.into());
            }
        };
        if !added.success() {
            pending.kill().await;
            return Err(AgentError::AddFailed {
                exit_code: added.exit_code,
                stderr: added.stderr,
            });
        }

        let mut sessions = self.inner.lock().await;
        if sessions.values().any(|s| s.auth_sock == session.auth_sock) {
            drop(sessions);
            pending.kill().await;
            return Err(AgentError::SocketInUse(session.auth_sock));
        }
        sessions.insert(conn, session.clone());
        pending.disarm();
        info!("ssh-agent ready for connection {conn}");
        Ok(session)
    }

    /// Environment overrides for git processes run on behalf of `conn`:
    /// `SSH_AUTH_SOCK` pointing at its agent, or nothing when it has none.
    /// Everything else is inherited from the worker.
    pub async fn agent_env(&self, conn: ConnectionId) -> HashMap<String, String> {
        let mut env = HashMap::new();
        if let Some(session) = self.inner.lock().await.get(&conn) {
            env.insert("SSH_AUTH_SOCK".to_string(), session.auth_sock.clone());
        }
        env
    }

    pub async fn session(&self, conn: ConnectionId) -> Option<AgentSession> {
        self.inner.lock().await.get(&conn).cloned()
    }

    /// Kill `conn`'s agent and forget it. No-op when there is none.
    pub async fn destroy_agent(&self, conn: ConnectionId) {
        let removed = self.inner.lock().await.remove(&conn);
        if let Some(session) = removed {
            self.kill_agent(&session).await;
            debug!("Destroyed ssh-agent for {conn}");
        }
    }

    /// Kill every agent. Called on worker shutdown.
    pub async fn destroy_all(&self) {
        let drained: Vec<AgentSession> = self.inner.lock().await.drain().map(|(_, s)| s).collect();
        for session in &drained {
            self.kill_agent(session).await;
        }
        if !drained.is_empty() {
            info!("Destroyed {} ssh-agent session(s)", drained.len());
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// `ssh-agent -k`, falling back to SIGTERM.
    async fn kill_agent(&self, session: &AgentSession) {
        let mut cmd = Command::new(&self.agent_program);
        cmd.arg("-k")
            .env("SSH_AGENT_PID", session.agent_pid.to_string())
            .env("SSH_AUTH_SOCK", &session.auth_sock);
        match run_captured(cmd, None).await {
            Ok(out) if out.success() => return,
            Ok(out) => warn!(
                "ssh-agent -k exited {} for pid {}",
                out.exit_code, session.agent_pid
            ),
            Err(e) => warn!("ssh-agent -k failed for pid {}: {e}", session.agent_pid),
        }
        if session.agent_pid > 0 {
            if let Err(e) = kill(Pid::from_raw(session.agent_pid), Signal::SIGTERM) {
                warn!("SIGTERM to ssh-agent {} failed: {e}", session.agent_pid);
            }
        }
    }
}

/// An agent that is started but not yet recorded in the table. Unless
/// [`PendingAgent::disarm`] is reached, the agent is killed, from a spawned
/// task when the owning future is dropped mid-flight.
struct PendingAgent {
    sessions: AgentSessions,
    session: Option<AgentSession>,
}

impl PendingAgent {
    fn new(sessions: AgentSessions, session: AgentSession) -> Self {
        Self {
            sessions,
            session: Some(session),
        }
    }

    fn disarm(mut self) {
        self.session = None;
    }

    async fn kill(mut self) {
        if let Some(session) = self.session.take() {
            self.sessions.kill_agent(&session).await;
        }
    }
}

impl Drop for PendingAgent {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        warn!(
            "ssh-agent init abandoned, killing pid {}",
            session.agent_pid
        );
        let sessions = self.sessions.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { sessions.kill_agent(&session).await });
            }
            Err(_) => {
                if session.agent_pid > 0 {
                    let _ = kill(Pid::from_raw(session.agent_pid), Signal::SIGTERM);
                }
            }
        }
    }
}

/// Parse `ssh-agent -s` output:
///
/// ```text
/// SSH_AUTH_SOCK=/tmp/ssh-XXXX/agent.123; export SSH_AUTH_SOCK;
/// SSH_AGENT_PID=124; export SSH_AGENT_PID;
/// ```
fn parse_agent_output(output: &str) -> Option<AgentSession> {
    let auth_sock = extract_var(output, "SSH_AUTH_SOCK")?;
    let agent_pid = extract_var(output, "SSH_AGENT_PID")?.parse().ok()?;
    Some(AgentSession {
        auth_sock: auth_sock.to_string(),
        agent_pid,
    })
}

fn extract_var<'a>(output: &'a str, name: &str) -> Option<&'a str> {
    let marker = format!("{name}=");
    let start = output.find(&marker)? + marker.len();
    let rest = &output[start..];
    let value = &rest[..rest.find(';')?];
    (!value.is_empty()).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Duration;

    fn write_script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    /// Fake ssh-agent handing out a fresh socket per start (or always the same
    /// one when `fixed_sock` is set). `-k` calls are appended to `killed.log`.
    fn fake_agents(dir: &Path, fixed_sock: bool) -> AgentSessions {
        let d = dir.display();
        let sock = if fixed_sock {
            format!("{d}/agent.sock")
        } else {
            format!("{d}/agent.$n.sock")
        };
        let agent = write_script(
            dir,
            "ssh-agent",
            &format!(
                r#"if [ "$1" = "-k" ]; then
  echo "$SSH_AGENT_PID $SSH_AUTH_SOCK" >> {d}/killed.log
  exit 0
fi
n=$(cat {d}/count 2>/dev/null || echo 0)
n=$((n + 1))
echo $n > {d}/count
echo "SSH_AUTH_SOCK={sock}; export SSH_AUTH_SOCK;"
echo "SSH_AGENT_PID=$((40000 + n)); export SSH_AGENT_PID;"
echo "echo Agent pid $((40000 + n));"
"#
            ),
        );
        let add = write_script(
            dir,
            "ssh-add",
            &format!(
                r#"key=$(cat)
case "$key" in
  *BAD*) echo "Error loading key \"(stdin)\": invalid format" >&2; exit 1 ;;
esac
printf '%s' "$key" > "$SSH_AUTH_SOCK.key"
echo "Identity added: (stdin)" >&2
"#
            ),
        );
        AgentSessions::new(&AgentConfig {
            agent_program: agent,
            add_program: add,
        })
    }

    fn killed(dir: &Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("killed.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn parses_agent_startup_output() {
        let out = "SSH_AUTH_SOCK=/tmp/ssh-abc/agent.77; export SSH_AUTH_SOCK;\n\
                   SSH_AGENT_PID=78; export SSH_AGENT_PID;\necho Agent pid 78;\n";
        let session = parse_agent_output(out).unwrap();
        assert_eq!(session.auth_sock, "/tmp/ssh-abc/agent.77");
        assert_eq!(session.agent_pid, 78);
    }

    #[test]
    fn rejects_garbage_agent_output() {
        assert!(parse_agent_output("could not open socket").is_none());
        assert!(parse_agent_output("SSH_AUTH_SOCK=/x; SSH_AGENT_PID=abc;").is_none());
    }

    #[tokio::test]
    async fn init_loads_key_and_exposes_env() {
        let dir = tempfile::tempdir().unwrap();
        let agents = fake_agents(dir.path(), false);
        let conn = ConnectionId::new();

        let session = agents
            .init_agent(conn, "-----BEGIN KEY-----\nabc\n-----END KEY-----\n\n  ")
            .await
            .unwrap();
        let loaded = std::fs::read_to_string(format!("{}.key", session.auth_sock)).unwrap();
        assert_eq!(loaded, "-----BEGIN KEY-----\nabc\n-----END KEY-----");

        let env = agents.agent_env(conn).await;
        assert_eq!(env.get("SSH_AUTH_SOCK"), Some(&session.auth_sock));
    }

    #[tokio::test]
    async fn env_without_session_has_no_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let agents = fake_agents(dir.path(), false);
        assert!(agents.agent_env(ConnectionId::new()).await.is_empty());
    }

    #[tokio::test]
    async fn env_survives_non_utf8_ambient_variables() {
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        let agents = fake_agents(dir.path(), false);
        let conn = ConnectionId::new();
        let session = agents.init_agent(conn, "key").await.unwrap();

        std::env::set_var(
            "GITYAK_TEST_NON_UTF8",
            std::ffi::OsStr::from_bytes(b"\xff\xfe"),
        );
        let env = agents.agent_env(conn).await;
        std::env::remove_var("GITYAK_TEST_NON_UTF8");

        assert_eq!(env.len(), 1);
        assert_eq!(env.get("SSH_AUTH_SOCK"), Some(&session.auth_sock));
    }

    #[tokio::test]
    async fn abandoned_init_kills_the_new_agent() {
        let dir = tempfile::tempdir().unwrap();
        let d = dir.path().display();
        let agent = write_script(
            dir.path(),
            "ssh-agent",
            &format!(
                r#"if [ "$1" = "-k" ]; then
  echo "$SSH_AGENT_PID $SSH_AUTH_SOCK" >> {d}/killed.log
  exit 0
fi
echo "SSH_AUTH_SOCK={d}/agent.sock; export SSH_AUTH_SOCK;"
echo "SSH_AGENT_PID=40001; export SSH_AGENT_PID;"
"#
            ),
        );
        let add = write_script(dir.path(), "ssh-add", "cat > /dev/null\nsleep 5\n");
        let agents = AgentSessions::new(&AgentConfig {
            agent_program: agent,
            add_program: add,
        });
        let conn = ConnectionId::new();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(1000), agents.init_agent(conn, "key")).await;
        assert!(abandoned.is_err());

        for _ in 0..100 {
            if !killed(dir.path()).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            killed(dir.path()),
            vec![format!("40001 {d}/agent.sock")]
        );
        assert!(agents.is_empty().await);
    }

    #[tokio::test]
    async fn reinit_destroys_previous_agent() {
        let dir = tempfile::tempdir().unwrap();
        let agents = fake_agents(dir.path(), false);
        let conn = ConnectionId::new();

        let first = agents.init_agent(conn, "key-one").await.unwrap();
        let second = agents.init_agent(conn, "key-two").await.unwrap();
        assert_ne!(first.auth_sock, second.auth_sock);
        assert_eq!(agents.len().await, 1);
        assert_eq!(
            killed(dir.path()),
            vec![format!("{} {}", first.agent_pid, first.auth_sock)]
        );
    }

    #[tokio::test]
    async fn failed_key_load_kills_new_agent() {
        let dir = tempfile::tempdir().unwrap();
        let agents = fake_agents(dir.path(), false);
        let conn = ConnectionId::new();

        let err = agents.init_agent(conn, "BAD KEY").await.unwrap_err();
        assert!(err.to_string().starts_with("ssh-add failed (exit 1): Error loading key"));
        assert!(agents.is_empty().await);
        assert_eq!(killed(dir.path()).len(), 1);
    }

    #[tokio::test]
    async fn sessions_are_isolated_per_connection() {
        let dir = tempfile::tempdir().unwrap();
        let agents = fake_agents(dir.path(), false);
        let a = ConnectionId::new();
        let b = ConnectionId::new();

        agents.init_agent(a, "key-a").await.unwrap();
        let sb = agents.init_agent(b, "key-b").await.unwrap();

        agents.destroy_agent(a).await;
        assert!(agents.session(a).await.is_none());
        assert_eq!(agents.session(b).await, Some(sb));
    }

    #[tokio::test]
    async fn duplicate_socket_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let agents = fake_agents(dir.path(), true);

        agents.init_agent(ConnectionId::new(), "key-a").await.unwrap();
        let err = agents
            .init_agent(ConnectionId::new(), "key-b")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::SocketInUse(_)));
        assert_eq!(agents.len().await, 1);
        assert_eq!(killed(dir.path()).len(), 1);
    }

    #[tokio::test]
    async fn destroy_without_session_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let agents = fake_agents(dir.path(), false);
        agents.destroy_agent(ConnectionId::new()).await;
        assert!(killed(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn destroy_all_kills_everything() {
        let dir = tempfile::tempdir().unwrap();
        let agents = fake_agents(dir.path(), false);
        agents.init_agent(ConnectionId::new(), "k1").await.unwrap();
        agents.init_agent(ConnectionId::new(), "k2").await.unwrap();

        agents.destroy_all().await;
        assert!(agents.is_empty().await);
        assert_eq!(killed(dir.path()).len(), 2);
    }

    #[tokio::test]
    async fn unparseable_agent_output_is_start_failure() {
        let dir = tempfile::tempdir().unwrap();
        let agent = write_script(dir.path(), "ssh-agent", "echo nope\n");
        let agents = AgentSessions::new(&AgentConfig {
            agent_program: agent,
            add_program: "true".to_string(),
        });
        let err = agents
            .init_agent(ConnectionId::new(), "k")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Failed to start ssh-agent");
    }
}
