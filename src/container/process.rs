use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicI32, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use crate::container::ContainerError;

/// Environment variable telling the provider process where to open its
/// control socket.
pub const SOCKET_PATH_ENV: &str = "CONTROL_SOCKET_PATH";

/// Owns one supervised provider process: spawns it with the control socket
/// path injected into its environment and drains its output into the log.
pub struct ProcessHandle {
    name: String,
    command: Vec<String>,
    socket_path: PathBuf,
    // Pid of the running child, 0 when not running. Kept atomic so `stop`
    // does not need to contend with `serve`.
    pid: AtomicI32,
}

impl ProcessHandle {
    pub fn new(
        name: &str,
        command: Vec<String>,
        socket_dir: &Path,
    ) -> Result<Self, ContainerError> {
        // An executable alone is not a valid provider invocation; every
        // provider takes at least a script path or argument.
        if command.len() < 2 {
            return Err(ContainerError::InvalidCommand(command.join(" ")));
        }

        let socket_path = socket_dir.join(format!("stevedore-{name}.sock"));
        if socket_path.exists() {
            log::warn!("[{name}] stale socket already present at {socket_path:?}");
        }

        Ok(Self {
            name: name.to_string(),
            command,
            socket_path,
            pid: AtomicI32::new(0),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Spawns the provider and blocks until it exits, draining its
    /// stdout/stderr into the log line-by-line so the child never stalls
    /// on a full pipe.
    pub async fn serve(&self) -> Result<ExitStatus, ContainerError> {
        log::info!("[{}] starting: {}", self.name, self.command.join(" "));

        let mut child = Command::new(&self.command[0])
            .args(&self.command[1..])
            .env(SOCKET_PATH_ENV, &self.socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ContainerError::Spawn {
                name: self.name.clone(),
                source,
            })?;

        if let Some(pid) = child.id() {
            self.pid.store(pid as i32, Ordering::SeqCst);
        }

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain_output(self.name.clone(), "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_output(self.name.clone(), "stderr", stderr));
        }

        let status = child.wait().await;
        self.pid.store(0, Ordering::SeqCst);

        let status = status?;
        log::info!("[{}] process exited with {status}", self.name);
        Ok(status)
    }

    /// Asks the provider to terminate. Safe to call when the process has
    /// already exited.
    pub fn stop(&self) {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid == 0 {
            log::debug!("[{}] stop requested but process is not running", self.name);
            return;
        }

        log::info!("[{}] sending SIGTERM to pid {pid}", self.name);
        if let Err(e) = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid),
            nix::sys::signal::Signal::SIGTERM,
        ) {
            log::warn!("[{}] failed to signal pid {pid}: {e}", self.name);
        }
    }
}

/// Read errors end the loop quietly; the pipe breaking is the normal way a
/// provider exit looks from this side.
async fn drain_output(name: String, stream: &'static str, reader: impl AsyncRead + Unpin) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        log::info!("[{name}] {stream}: {line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_command_needs_two_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let result = ProcessHandle::new("short", command(&["/bin/true"]), dir.path());
        assert!(matches!(result, Err(ContainerError::InvalidCommand(_))));
    }

    #[test]
    fn test_socket_path_is_derived_from_name() {
        let dir = tempfile::tempdir().unwrap();
        let handle = ProcessHandle::new("ruby-checks", command(&["/bin/sleep", "1"]), dir.path())
            .unwrap();
        assert_eq!(
            handle.socket_path(),
            dir.path().join("stevedore-ruby-checks.sock")
        );
    }

    #[tokio::test]
    async fn test_serve_waits_for_exit() {
        let dir = tempfile::tempdir().unwrap();
        let handle =
            ProcessHandle::new("exits", command(&["/bin/sh", "-c", "exit 0"]), dir.path())
                .unwrap();
        let status = handle.serve().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_serve_injects_socket_path_env() {
        let dir = tempfile::tempdir().unwrap();
        let handle = ProcessHandle::new(
            "env-check",
            command(&["/bin/sh", "-c", "test -n \"$CONTROL_SOCKET_PATH\""]),
            dir.path(),
        )
        .unwrap();
        let status = handle.serve().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let handle = ProcessHandle::new(
            "missing",
            command(&["/nonexistent/binary", "arg"]),
            dir.path(),
        )
        .unwrap();
        assert!(matches!(
            handle.serve().await,
            Err(ContainerError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_terminates_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let handle = std::sync::Arc::new(
            ProcessHandle::new("sleeper", command(&["/bin/sleep", "60"]), dir.path()).unwrap(),
        );

        let serving = tokio::spawn({
            let handle = std::sync::Arc::clone(&handle);
            async move { handle.serve().await }
        });

        // Give the child a moment to start before signalling it.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        handle.stop();

        let status = serving.await.unwrap().unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let handle =
            ProcessHandle::new("done", command(&["/bin/sh", "-c", "exit 0"]), dir.path())
                .unwrap();
        handle.serve().await.unwrap();
        // Process already gone; stop must not panic or error out.
        handle.stop();
        handle.stop();
    }
}
