//! SSH tunnel lifecycle: provision, launch, forward, attach, supervise.
//!
//! [`TunnelManager::connect`] runs these steps strictly in order, and the
//! first failure aborts the rest:
//!
//! 1. **Provision**: ask `~/.local/bin/gityak --version`; upload the local
//!    worker binary only if the answer differs from the expected version.
//! 2. **Launch**: run `ONESHOT=1 PORT=0 ~/.local/bin/gityak` over SSH and
//!    wait for its `SERVER_READY|PORT:<n>` line.
//! 3. **Pick a local port.**
//! 4. **Forward**: `ssh -L <local>:127.0.0.1:<remote> -N`, considered up
//!    after a short settle delay (ssh has no ready signal for forwards).
//! 5. **Attach** a [`DirectTransport`] to `ws://127.0.0.1:<local>/`.
//! 6. **Heartbeat** every few seconds. Failures are only logged: the remote
//!    worker's own watchdog decides when the session is dead.
//!
//! [`TunnelManager::close`] tears down in reverse. Each step is best-effort
//! and independent of the others. The remote worker itself is not killed
//! remotely; once heartbeats stop it exits on its own.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::direct::DirectTransport;
use crate::error::TransportError;
use crate::protocol::{Command, WORKER_VERSION};
use crate::remote::{capture, run_remote, RemoteHost};

/// Where the worker lives on remote hosts.
pub const REMOTE_BINARY_PATH: &str = "~/.local/bin/gityak";
/// Upload destination, relative to the remote home directory.
pub const REMOTE_UPLOAD_TARGET: &str = ".local/bin/gityak";
/// Prefix of the worker's ready line.
pub const READY_PREFIX: &str = "SERVER_READY|PORT:";

/// Tunables for one manager.
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    /// Local worker binary uploaded when the remote one is missing or stale.
    pub worker_binary: PathBuf,
    /// Version string the remote `--version` must print to skip the upload.
    pub worker_version: String,
    pub launch_timeout: Duration,
    pub settle_delay: Duration,
    pub heartbeat_interval: Duration,
}

impl TunnelOptions {
    pub fn new(worker_binary: PathBuf) -> Self {
        Self {
            worker_binary,
            worker_version: WORKER_VERSION.to_string(),
            launch_timeout: Duration::from_secs(15),
            settle_delay: Duration::from_millis(800),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// Where a connection attempt currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    /// Probing the remote worker version.
    Checking,
    /// Uploading the worker binary.
    Uploading,
    /// Waiting for the remote worker's ready line.
    Starting,
    /// Opening the port forward.
    Tunneling,
    Connected,
    Error(String),
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionPhase::Idle => f.write_str("idle"),
            ConnectionPhase::Checking => f.write_str("checking"),
            ConnectionPhase::Uploading => f.write_str("uploading"),
            ConnectionPhase::Starting => f.write_str("starting"),
            ConnectionPhase::Tunneling => f.write_str("tunneling"),
            ConnectionPhase::Connected => f.write_str("connected"),
            ConnectionPhase::Error(e) => write!(f, "error: {e}"),
        }
    }
}

/// Everything one live tunnel owns.
struct TunnelSession {
    remote_port: u16,
    local_port: u16,
    transport: Arc<DirectTransport>,
    /// The `ssh ... gityak` launch process (local handle only).
    worker: Child,
    /// The `ssh -L` forward.
    tunnel: Child,
    heartbeat: JoinHandle<()>,
}

/// Owns at most one tunnel session to one remote host.
pub struct TunnelManager<H: RemoteHost> {
    host: H,
    options: TunnelOptions,
    session: Option<TunnelSession>,
    phase: watch::Sender<ConnectionPhase>,
}

impl<H: RemoteHost> TunnelManager<H> {
    pub fn new(host: H, options: TunnelOptions) -> Self {
        let (phase, _) = watch::channel(ConnectionPhase::Idle);
        Self {
            host,
            options,
            session: None,
            phase,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Watch connection phase changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionPhase> {
        self.phase.subscribe()
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// `(local_port, remote_port)` of the live session.
    pub fn ports(&self) -> Option<(u16, u16)> {
        self.session.as_ref().map(|s| (s.local_port, s.remote_port))
    }

    /// The live session's transport.
    pub fn transport(&self) -> Option<Arc<DirectTransport>> {
        self.session.as_ref().map(|s| Arc::clone(&s.transport))
    }

    fn set_phase(&self, phase: ConnectionPhase) {
        debug!("Tunnel to {}: {phase}", self.host.describe());
        self.phase.send_replace(phase);
    }

    /// Establish a fresh session, tearing down any existing one first.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        self.close().await;
        info!("Connecting to {} over SSH tunnel", self.host.describe());

        match self.establish().await {
            Ok(session) => {
                info!(
                    "Tunnel up: 127.0.0.1:{} -> {}:{}",
                    session.local_port,
                    self.host.describe(),
                    session.remote_port
                );
                self.session = Some(session);
                self.set_phase(ConnectionPhase::Connected);
                Ok(())
            }
            Err(e) => {
                warn!("Tunnel to {} failed: {e}", self.host.describe());
                self.set_phase(ConnectionPhase::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<TunnelSession, TransportError> {
        self.set_phase(ConnectionPhase::Checking);
        self.provision().await?;

        self.set_phase(ConnectionPhase::Starting);
        let (mut worker, remote_port) = self.launch_worker().await?;

        self.set_phase(ConnectionPhase::Tunneling);
        let local_port = match free_local_port().await {
            Ok(p) => p,
            Err(e) => {
                kill_child("worker", &mut worker).await;
                return Err(e);
            }
        };
        let tunnel = match self.open_forward(local_port, remote_port).await {
            Ok(child) => child,
            Err(e) => {
                kill_child("worker", &mut worker).await;
                return Err(e);
            }
        };

        let transport = Arc::new(DirectTransport::open(&format!(
            "ws://127.0.0.1:{local_port}/"
        )));
        let heartbeat = spawn_heartbeat(Arc::clone(&transport), self.options.heartbeat_interval);

        Ok(TunnelSession {
            remote_port,
            local_port,
            transport,
            worker,
            tunnel,
            heartbeat,
        })
    }

    /// Make sure the remote worker is at the expected version.
    ///
    /// Returns `true` if a binary was uploaded. Running it again against an
    /// up-to-date host uploads nothing.
    pub async fn provision(&self) -> Result<bool, TransportError> {
        let reported = run_remote(
            &self.host,
            &format!("{REMOTE_BINARY_PATH} --version 2>/dev/null || echo NOT_INSTALLED"),
        )
        .await?;
        let found = reported.trim();
        if found == self.options.worker_version {
            debug!("Remote worker {found} is current");
            return Ok(false);
        }

        info!(
            "Provisioning worker {} on {} (found {found:?})",
            self.options.worker_version,
            self.host.describe()
        );
        self.set_phase(ConnectionPhase::Uploading);
        if !self.options.worker_binary.is_file() {
            return Err(TransportError::Process(format!(
                "Worker binary not found: {}",
                self.options.worker_binary.display()
            )));
        }

        run_remote(&self.host, "mkdir -p ~/.local/bin").await?;
        let upload = capture(
            self.host
                .upload(&self.options.worker_binary, REMOTE_UPLOAD_TARGET),
        )
        .await?;
        if upload.exit_code != 0 {
            let stderr = upload.stderr.trim();
            return Err(TransportError::Process(if stderr.is_empty() {
                "SCP failed".to_string()
            } else {
                stderr.to_string()
            }));
        }
        run_remote(&self.host, &format!("chmod +x {REMOTE_BINARY_PATH}")).await?;
        info!("Provisioning done");
        Ok(true)
    }

    /// Start the remote worker and wait for its ready line.
    ///
    /// On failure the launch process is killed before returning.
    pub async fn launch_worker(&self) -> Result<(Child, u16), TransportError> {
        let mut cmd = self
            .host
            .command(&format!("ONESHOT=1 PORT=0 {REMOTE_BINARY_PATH}"));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .map_err(|e| TransportError::Process(format!("Failed to start remote worker: {e}")))?;

        let Some(stdout) = child.stdout.take() else {
            kill_child("worker", &mut child).await;
            return Err(TransportError::Process(
                "Failed to take worker stdout".to_string(),
            ));
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_lines("worker stderr", BufReader::new(stderr).lines()));
        }
        let mut lines = BufReader::new(stdout).lines();

        let limit = self.options.launch_timeout;
        let ready = tokio::time::timeout(limit, wait_for_ready(&mut lines)).await;
        match ready {
            Ok(Ok(Some(port))) => {
                debug!("Remote worker ready on port {port}");
                tokio::spawn(drain_lines("worker stdout", lines));
                Ok((child, port))
            }
            Ok(Ok(None)) => {
                let code = match child.wait().await {
                    Ok(status) => status
                        .code()
                        .map_or_else(|| "unknown".to_string(), |c| c.to_string()),
                    Err(_) => "unknown".to_string(),
                };
                Err(TransportError::Process(format!(
                    "Remote worker exited with code {code}"
                )))
            }
            Ok(Err(e)) => {
                kill_child("worker", &mut child).await;
                Err(e.into())
            }
            Err(_) => {
                kill_child("worker", &mut child).await;
                Err(TransportError::Timeout(format!(
                    "Worker startup timeout ({}s)",
                    limit.as_secs()
                )))
            }
        }
    }

    async fn open_forward(
        &self,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Child, TransportError> {
        let mut cmd = self.host.forward(local_port, remote_port);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .map_err(|e| TransportError::Process(format!("Failed to start SSH tunnel: {e}")))?;

        tokio::time::sleep(self.options.settle_delay).await;

        match child.try_wait() {
            Ok(None) => {
                if let Some(stderr) = child.stderr.take() {
                    tokio::spawn(drain_lines("tunnel stderr", BufReader::new(stderr).lines()));
                }
                Ok(child)
            }
            Ok(Some(status)) => {
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                if !stderr.trim().is_empty() {
                    warn!("SSH tunnel: {}", stderr.trim());
                }
                Err(TransportError::Process(format!(
                    "SSH tunnel exited early ({status})"
                )))
            }
            Err(e) => {
                kill_child("tunnel", &mut child).await;
                Err(e.into())
            }
        }
    }

    /// Send one call over the live session.
    pub async fn call(&self, command: Command, payload: Value) -> Result<Value, TransportError> {
        let transport = self.transport().ok_or(TransportError::NotConnected)?;
        transport.call(command, payload).await
    }

    /// Tear the session down: heartbeat, transport, forward, launch process.
    /// Safe to call at any time, any number of times.
    pub async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            info!("Closing tunnel to {}", self.host.describe());
            session.heartbeat.abort();
            session.transport.close();
            kill_child("tunnel", &mut session.tunnel).await;
            kill_child("worker", &mut session.worker).await;
        }
        self.set_phase(ConnectionPhase::Idle);
    }
}

impl<H: RemoteHost> Drop for TunnelManager<H> {
    fn drop(&mut self) {
        // Children are kill_on_drop; the heartbeat task is not.
        if let Some(session) = &self.session {
            session.heartbeat.abort();
            session.transport.close();
        }
    }
}

/// Extract the port from a `SERVER_READY|PORT:<n>` line.
pub fn parse_ready_line(line: &str) -> Option<u16> {
    let start = line.find(READY_PREFIX)? + READY_PREFIX.len();
    let digits: String = line[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

async fn wait_for_ready(lines: &mut Lines<BufReader<ChildStdout>>) -> std::io::Result<Option<u16>> {
    while let Some(line) = lines.next_line().await? {
        if let Some(port) = parse_ready_line(&line) {
            return Ok(Some(port));
        }
        debug!("worker: {line}");
    }
    Ok(None)
}

async fn drain_lines<R: tokio::io::AsyncBufRead + Unpin>(label: &'static str, mut lines: Lines<R>) {
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("{label}: {line}");
    }
}

/// Ask the OS for a free loopback port.
async fn free_local_port() -> Result<u16, TransportError> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.port())
}

fn spawn_heartbeat(transport: Arc<DirectTransport>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // First tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = transport.call(Command::Heartbeat, json!({})).await {
                warn!("Heartbeat failed: {e}");
            }
        }
    })
}

/// Best-effort kill and reap.
async fn kill_child(label: &str, child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!("{label} already gone: {e}");
    }
    match tokio::time::timeout(Duration::from_secs(2), child.wait()).await {
        Ok(Ok(status)) => debug!("{label} exited: {status}"),
        Ok(Err(e)) => warn!("Failed to reap {label}: {e}"),
        Err(_) => warn!("{label} did not exit after kill"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Runs "remote" commands locally with `HOME` pointed at a temp dir.
    struct FakeHost {
        home: PathBuf,
        uploads: Arc<AtomicUsize>,
        forward_script: String,
    }

    impl RemoteHost for FakeHost {
        fn command(&self, remote_cmd: &str) -> tokio::process::Command {
            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c").arg(remote_cmd).env("HOME", &self.home);
            cmd
        }

        fn upload(&self, local: &Path, remote: &str) -> tokio::process::Command {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            let mut cmd = tokio::process::Command::new("cp");
            cmd.arg(local).arg(self.home.join(remote));
            cmd
        }

        fn forward(&self, _local_port: u16, _remote_port: u16) -> tokio::process::Command {
            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c").arg(&self.forward_script);
            cmd
        }

        fn describe(&self) -> String {
            "fake-host".to_string()
        }
    }

    struct Fixture {
        _dir: TempDir,
        home: PathBuf,
        uploads: Arc<AtomicUsize>,
        manager: TunnelManager<FakeHost>,
    }

    /// `behaviour` is what the fake worker does when launched (anything but
    /// `--version`).
    fn fixture(behaviour: &str, forward_script: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("home");
        std::fs::create_dir(&home).unwrap();

        let binary = dir.path().join("gityak");
        std::fs::write(
            &binary,
            format!(
                "#!/bin/sh\nif [ \"$1\" = \"--version\" ]; then echo 1.0.0; exit 0; fi\n{behaviour}\n"
            ),
        )
        .unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let uploads = Arc::new(AtomicUsize::new(0));
        let host = FakeHost {
            home: home.clone(),
            uploads: Arc::clone(&uploads),
            forward_script: forward_script.to_string(),
        };
        let mut options = TunnelOptions::new(binary);
        options.launch_timeout = Duration::from_secs(2);
        options.settle_delay = Duration::from_millis(100);
        options.heartbeat_interval = Duration::from_millis(200);

        Fixture {
            _dir: dir,
            home,
            uploads,
            manager: TunnelManager::new(host, options),
        }
    }

    const READY: &str = "echo starting\necho 'SERVER_READY|PORT:45678'\nsleep 10";

    #[test]
    fn ready_line_parsing() {
        assert_eq!(parse_ready_line("SERVER_READY|PORT:41234"), Some(41234));
        assert_eq!(parse_ready_line("  SERVER_READY|PORT:80\r"), Some(80));
        assert_eq!(parse_ready_line("SERVER_READY|PORT:"), None);
        assert_eq!(parse_ready_line("SERVER_READY|PORT:99999"), None);
        assert_eq!(parse_ready_line("listening on 8080"), None);
    }

    #[tokio::test]
    async fn provisioning_is_idempotent() {
        let f = fixture(READY, "sleep 10");

        assert!(f.manager.provision().await.unwrap());
        assert_eq!(f.uploads.load(Ordering::SeqCst), 1);
        let installed = f.home.join(".local/bin/gityak");
        let mode = std::fs::metadata(&installed).unwrap().permissions().mode();
        assert!(mode & 0o111 != 0, "not executable: {mode:o}");

        assert!(!f.manager.provision().await.unwrap());
        assert_eq!(f.uploads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_remote_version_is_replaced() {
        let f = fixture(READY, "sleep 10");
        let bin_dir = f.home.join(".local/bin");
        std::fs::create_dir_all(&bin_dir).unwrap();
        let old = bin_dir.join("gityak");
        std::fs::write(&old, "#!/bin/sh\necho 0.9.0\n").unwrap();
        std::fs::set_permissions(&old, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert!(f.manager.provision().await.unwrap());
        assert_eq!(f.uploads.load(Ordering::SeqCst), 1);
        assert!(!f.manager.provision().await.unwrap());
    }

    #[tokio::test]
    async fn missing_local_binary_fails_provisioning() {
        let mut f = fixture(READY, "sleep 10");
        f.manager.options.worker_binary = PathBuf::from("/nonexistent/gityak");
        let err = f.manager.provision().await.unwrap_err();
        assert!(err.to_string().starts_with("Worker binary not found"));
        assert_eq!(f.uploads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn launch_reads_ready_port() {
        let f = fixture(READY, "sleep 10");
        f.manager.provision().await.unwrap();
        let (mut child, port) = f.manager.launch_worker().await.unwrap();
        assert_eq!(port, 45678);
        kill_child("worker", &mut child).await;
    }

    #[tokio::test]
    async fn launch_times_out_without_ready_line() {
        let mut f = fixture("sleep 10", "sleep 10");
        f.manager.options.launch_timeout = Duration::from_secs(1);
        f.manager.provision().await.unwrap();
        let err = f.manager.launch_worker().await.unwrap_err();
        assert_eq!(
            err,
            TransportError::Timeout("Worker startup timeout (1s)".to_string())
        );
    }

    #[tokio::test]
    async fn launch_reports_early_exit() {
        let f = fixture("echo 'address in use' >&2\nexit 3", "sleep 10");
        f.manager.provision().await.unwrap();
        let err = f.manager.launch_worker().await.unwrap_err();
        assert_eq!(
            err,
            TransportError::Process("Remote worker exited with code 3".to_string())
        );
    }

    #[tokio::test]
    async fn failed_connect_keeps_no_session() {
        let mut f = fixture("exit 3", "sleep 10");
        let mut phases = f.manager.subscribe();

        let err = f.manager.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::Process(_)));
        assert!(!f.manager.is_connected());
        assert_eq!(
            f.manager.phase(),
            ConnectionPhase::Error("Remote worker exited with code 3".to_string())
        );
        assert!(phases.has_changed().unwrap());
        assert_eq!(
            f.manager.call(Command::Heartbeat, json!({})).await,
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn tunnel_exiting_early_fails_connect() {
        let mut f = fixture(READY, "echo 'bind: Address already in use' >&2; exit 255");
        let err = f.manager.connect().await.unwrap_err();
        assert_eq!(
            err,
            TransportError::Process("SSH tunnel exited early (exit status: 255)".to_string())
        );
        assert!(!f.manager.is_connected());
    }

    #[tokio::test]
    async fn connect_then_close() {
        let mut f = fixture(READY, "sleep 10");
        f.manager.connect().await.unwrap();

        assert_eq!(f.manager.phase(), ConnectionPhase::Connected);
        let (local, remote) = f.manager.ports().unwrap();
        assert_eq!(remote, 45678);
        assert_ne!(local, 0);
        assert_eq!(f.uploads.load(Ordering::SeqCst), 1);

        // Reconnecting tears the old session down and skips the upload.
        f.manager.connect().await.unwrap();
        assert_eq!(f.uploads.load(Ordering::SeqCst), 1);

        f.manager.close().await;
        assert!(!f.manager.is_connected());
        assert_eq!(f.manager.phase(), ConnectionPhase::Idle);
        f.manager.close().await;
        assert_eq!(
            f.manager.call(Command::Heartbeat, json!({})).await,
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn close_without_session_is_safe() {
        let mut f = fixture(READY, "sleep 10");
        f.manager.close().await;
        f.manager.close().await;
        assert_eq!(f.manager.phase(), ConnectionPhase::Idle);
    }

    #[tokio::test]
    async fn failed_heartbeats_keep_the_session() {
        let mut f = fixture(READY, "sleep 10");
        f.manager.connect().await.unwrap();
        let transport = f.manager.transport().unwrap();
        // The fake forward never listens, so the transport closes and every
        // heartbeat fails.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!transport.is_open());
        assert!(f.manager.is_connected());
        f.manager.close().await;
    }
}
