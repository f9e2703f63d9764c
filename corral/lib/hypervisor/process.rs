//! The hypervisor OS process handle.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, Command},
    time::timeout,
};
use tracing::{error, warn};

use crate::{CorralError, CorralResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A spawned hypervisor process.
///
/// The child is spawned with kill-on-drop so an abandoned handle can never
/// leave an orphaned hypervisor behind.
pub struct VmmProcess {
    child: Child,
    vm_id: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmmProcess {
    /// Spawns the hypervisor executable bound to the given control socket.
    ///
    /// stdout/stderr are drained into per-VM log files under `log_dir`,
    /// rotating any previous log aside first.
    pub async fn spawn(
        binary: impl AsRef<Path>,
        vm_id: impl Into<String>,
        socket_path: impl AsRef<Path>,
        log_dir: impl AsRef<Path>,
    ) -> CorralResult<Self> {
        let vm_id = vm_id.into();
        let log_dir = log_dir.as_ref();
        fs::create_dir_all(log_dir).await?;

        let mut child = Command::new(binary.as_ref())
            .arg("--id")
            .arg(&vm_id)
            .arg("--api-socket")
            .arg(socket_path.as_ref())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Drain stdout/stderr so the child never blocks on a full pipe.
        if let Some(stdout) = child.stdout.take() {
            let path = log_dir.join(format!("{}.stdout.log", vm_id));
            tokio::spawn(drain_to_log(stdout, path));
        }
        if let Some(stderr) = child.stderr.take() {
            let path = log_dir.join(format!("{}.stderr.log", vm_id));
            tokio::spawn(drain_to_log(stderr, path));
        }

        Ok(Self { child, vm_id })
    }

    /// The OS process id, if the process is still running.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// The id of the VM this process hosts.
    pub fn vm_id(&self) -> &str {
        &self.vm_id
    }

    /// Whether the process has exited, observed through the OS handle.
    pub fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(status) => status.is_some(),
            Err(e) => {
                warn!(vm_id = %self.vm_id, error = %e, "failed to poll hypervisor process");
                true
            }
        }
    }

    /// Waits for the process to exit on its own, bounded by a deadline.
    ///
    /// Returns whether the process exited within the deadline.
    pub async fn wait_exit(&mut self, deadline: Duration) -> CorralResult<bool> {
        match timeout(deadline, self.child.wait()).await {
            Ok(status) => {
                status?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// Hard-terminates the process and reaps it. Always succeeds.
    pub async fn kill(&mut self) -> CorralResult<()> {
        if let Err(e) = self.child.start_kill() {
            // InvalidInput means the process was already reaped.
            if e.kind() != std::io::ErrorKind::InvalidInput {
                return Err(CorralError::Io(e));
            }
        }
        let _ = self.child.wait().await;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Copies a child output stream line-by-line into a log file.
async fn drain_to_log(stream: impl tokio::io::AsyncRead + Unpin + Send + 'static, path: PathBuf) {
    let mut file = match create_log_file(&path).await {
        Ok(file) => file,
        Err(e) => {
            error!(path = %path.display(), error = %e, "failed to create hypervisor log file");
            return;
        }
    };

    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Err(e) = file.write_all(format!("{}\n", line).as_bytes()).await {
            error!(path = %path.display(), error = %e, "failed to write hypervisor log");
            break;
        }
    }
    let _ = file.flush().await;
}

/// Creates a fresh log file, rotating any previous one aside.
async fn create_log_file(path: &Path) -> CorralResult<File> {
    if fs::try_exists(path).await.unwrap_or(false) {
        let backup = path.with_extension(format!(
            "{}.old",
            path.extension().unwrap_or_default().to_str().unwrap_or("")
        ));
        if let Err(e) = fs::rename(path, &backup).await {
            warn!(path = %path.display(), error = %e, "failed to rotate log file");
        }
    }

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await?;

    Ok(file)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_and_kill() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;

        // Any long-running binary stands in for the hypervisor here.
        let mut process = VmmProcess::spawn(
            "/bin/sleep",
            "vm-test",
            dir.path().join("vm.sock"),
            dir.path().join("logs"),
        )
        .await?;

        // `sleep` ignores our arguments and exits immediately on bad usage,
        // or keeps running; either way kill() must reap it cleanly.
        assert!(process.id().is_some() || process.has_exited());
        process.kill().await?;
        assert!(process.has_exited());

        Ok(())
    }

    #[tokio::test]
    async fn test_exit_detected_through_process_handle() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;

        let mut process = VmmProcess::spawn(
            "/bin/true",
            "vm-exit",
            dir.path().join("vm.sock"),
            dir.path().join("logs"),
        )
        .await?;

        assert!(process.wait_exit(Duration::from_secs(5)).await?);
        assert!(process.has_exited());

        Ok(())
    }

    #[tokio::test]
    async fn test_log_rotation_keeps_previous_log() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("vm.stdout.log");

        fs::write(&path, "previous run").await?;
        let _file = create_log_file(&path).await?;

        let rotated = fs::read_to_string(path.with_extension("log.old")).await?;
        assert_eq!(rotated, "previous run");

        Ok(())
    }
}
