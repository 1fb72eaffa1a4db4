//! Host backed by real processes in a per-session directory.

use super::{SandboxBooter, SandboxHost, SandboxProcess, ServerReady};
use crate::errors::{AppError, AppResult};
use crate::files::FileSystemTree;
use crate::output::{strip_terminal_codes, LineBuffer};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{timeout, Duration};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const TERMINATE_GRACE: Duration = Duration::from_millis(1500);

static SERVER_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1\]):(\d{2,5}))/?").expect("valid server url regex")
});

/// Dev-server address announced in a line of output, if any.
pub fn detect_server_url(line: &str) -> Option<ServerReady> {
    let captures = SERVER_URL_RE.captures(line)?;
    let port = captures.get(2)?.as_str().parse::<u16>().ok()?;
    let url = captures.get(1)?.as_str().replace("0.0.0.0", "localhost");
    Some(ServerReady { port, url })
}

pub struct LocalBooter {
    root: PathBuf,
    toolchain: String,
}

impl LocalBooter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            toolchain: "npm".to_string(),
        }
    }

    /// Program probed with `--version` before a session is created.
    pub fn with_toolchain(mut self, program: impl Into<String>) -> Self {
        self.toolchain = program.into();
        self
    }

    async fn probe_toolchain(&self) -> AppResult<String> {
        let mut command = Command::new(&self.toolchain);
        command
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let output = match timeout(PROBE_TIMEOUT, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(error)) => {
                return Err(AppError::Unsupported(format!(
                    "{} is not available on this host: {}",
                    self.toolchain, error
                )))
            }
            Err(_) => {
                return Err(AppError::Unsupported(format!(
                    "{} --version did not respond within {}s",
                    self.toolchain,
                    PROBE_TIMEOUT.as_secs()
                )))
            }
        };
        if !output.status.success() {
            return Err(AppError::Unsupported(format!(
                "{} --version exited with {}",
                self.toolchain, output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl SandboxBooter for LocalBooter {
    async fn boot(&self) -> AppResult<Arc<dyn SandboxHost>> {
        let version = self.probe_toolchain().await?;
        let dir = self.root.join(format!("session-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|error| sandbox_io_error("create session directory", error))?;
        tracing::info!(toolchain = %self.toolchain, version = %version, dir = %dir.display(), "local sandbox ready");
        Ok(Arc::new(LocalSandboxHost::new(dir)))
    }
}

fn sandbox_io_error(action: &str, error: std::io::Error) -> AppError {
    let message = format!("failed to {}: {}", action, error);
    if error.kind() == std::io::ErrorKind::OutOfMemory {
        AppError::OutOfMemory(message)
    } else {
        AppError::Sandbox(message)
    }
}

pub struct LocalSandboxHost {
    dir: PathBuf,
    children: Arc<Mutex<Vec<Arc<Mutex<Child>>>>>,
    torn_down: AtomicBool,
}

impl LocalSandboxHost {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            children: Arc::new(Mutex::new(Vec::new())),
            torn_down: AtomicBool::new(false),
        }
    }

    fn resolve(&self, path: &str) -> AppResult<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir))
        {
            return Err(AppError::Io(format!("path escapes sandbox: {}", path)));
        }
        Ok(self.dir.join(relative))
    }

    fn ensure_live(&self) -> AppResult<()> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(AppError::Sandbox("session has been torn down".to_string()));
        }
        Ok(())
    }
}

fn forward_stream<R>(
    stream: R,
    output: mpsc::UnboundedSender<String>,
    ready: mpsc::UnboundedSender<ServerReady>,
    announced: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        use tokio::io::AsyncReadExt;
        let mut reader = tokio::io::BufReader::new(stream);
        let mut chunk = vec![0_u8; 4096];
        let mut lines = LineBuffer::new();
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(size) => {
                    let text = String::from_utf8_lossy(&chunk[..size]).to_string();
                    if !announced.load(Ordering::SeqCst) {
                        for line in lines.push(&text) {
                            if let Some(server) = detect_server_url(&strip_terminal_codes(&line)) {
                                if !announced.swap(true, Ordering::SeqCst) {
                                    tracing::info!(url = %server.url, port = server.port, "server ready");
                                    let _ = ready.send(server);
                                }
                            }
                        }
                    }
                    // Receiver gone only means nobody is reading output any more.
                    let _ = output.send(text);
                }
                Err(error) => {
                    tracing::debug!(error = %error, "sandbox output stream closed");
                    break;
                }
            }
        }
    })
}

async fn terminate_then_kill(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }

    if timeout(TERMINATE_GRACE, child.wait()).await.is_ok() {
        return;
    }

    let _ = child.start_kill();
    let _ = timeout(Duration::from_secs(2), child.wait()).await;
}

#[async_trait]
impl SandboxHost for LocalSandboxHost {
    async fn mount(&self, tree: &FileSystemTree) -> AppResult<()> {
        self.ensure_live()?;
        for (path, contents) in tree.to_files() {
            let target = self.resolve(&path)?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|error| AppError::Mount(format!("{}: {}", parent.display(), error)))?;
            }
            tokio::fs::write(&target, contents)
                .await
                .map_err(|error| AppError::Mount(format!("{}: {}", target.display(), error)))?;
        }
        tracing::debug!(files = tree.file_count(), dir = %self.dir.display(), "mounted file tree");
        Ok(())
    }

    async fn spawn(&self, command: &str, args: &[String]) -> AppResult<SandboxProcess> {
        self.ensure_live()?;
        let mut process = Command::new(command);
        process
            .args(args)
            .current_dir(&self.dir)
            .env("NO_COLOR", "1")
            .env("BROWSER", "none")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = process.spawn().map_err(|error| {
            if error.kind() == std::io::ErrorKind::NotFound {
                AppError::Unsupported(format!("{} not found: {}", command, error))
            } else {
                AppError::Io(format!("failed to spawn {}: {}", command, error))
            }
        })?;
        tracing::debug!(command, args = ?args, pid = ?child.id(), "spawned sandbox process");

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let announced = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = [
            child
                .stdout
                .take()
                .map(|stream| forward_stream(stream, output_tx.clone(), ready_tx.clone(), announced.clone())),
            child
                .stderr
                .take()
                .map(|stream| forward_stream(stream, output_tx.clone(), ready_tx.clone(), announced.clone())),
        ]
        .into_iter()
        .flatten()
        .collect();
        drop(output_tx);
        drop(ready_tx);

        let child = Arc::new(Mutex::new(child));
        self.children.lock().await.push(child.clone());

        let (exit_tx, exit_rx) = oneshot::channel();
        let command = command.to_string();
        let children = self.children.clone();
        tokio::spawn(async move {
            let code = loop {
                let status = {
                    let mut child = child.lock().await;
                    child.try_wait()
                };
                match status {
                    Ok(Some(status)) => break status.code().unwrap_or(-1),
                    Ok(None) => tokio::time::sleep(EXIT_POLL_INTERVAL).await,
                    Err(error) => {
                        tracing::warn!(command = %command, error = %error, "failed to poll sandbox process");
                        break -1;
                    }
                }
            };
            children.lock().await.retain(|entry| !Arc::ptr_eq(entry, &child));
            // Flush remaining output before announcing the exit.
            for reader in readers {
                let _ = reader.await;
            }
            tracing::debug!(command = %command, code, "sandbox process exited");
            let _ = exit_tx.send(code);
        });

        Ok(SandboxProcess {
            output: output_rx,
            ready: ready_rx,
            exit: exit_rx,
        })
    }

    async fn read_file(&self, path: &str) -> AppResult<String> {
        let target = self.resolve(path)?;
        tokio::fs::read_to_string(&target)
            .await
            .map_err(|error| AppError::Io(format!("{}: {}", path, error)))
    }

    async fn write_file(&self, path: &str, contents: &str) -> AppResult<()> {
        self.ensure_live()?;
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, contents)
            .await
            .map_err(|error| AppError::Io(format!("{}: {}", path, error)))
    }

    async fn teardown(&self) -> AppResult<()> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let children = std::mem::take(&mut *self.children.lock().await);
        for child in children {
            let mut child = child.lock().await;
            if matches!(child.try_wait(), Ok(None)) {
                terminate_then_kill(&mut child).await;
            }
        }
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(AppError::Io(format!(
                "failed to remove {}: {}",
                self.dir.display(),
                error
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{detect_server_url, LocalBooter, LocalSandboxHost};
    use crate::errors::AppError;
    use crate::files::FileSystemTree;
    use crate::models::FileMap;
    use crate::sandbox::{SandboxBooter, SandboxHost};

    #[test]
    fn detects_vite_banner() {
        let ready = detect_server_url("  ➜  Local:   http://localhost:5173/").expect("url");
        assert_eq!(ready.port, 5173);
        assert_eq!(ready.url, "http://localhost:5173");

        let wildcard = detect_server_url("listening on http://0.0.0.0:3000").expect("url");
        assert_eq!(wildcard.url, "http://localhost:3000");
        assert!(detect_server_url("VITE v5.4.2 ready in 300 ms").is_none());
    }

    #[tokio::test]
    async fn mount_and_read_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let host = LocalSandboxHost::new(dir.path().join("session"));
        let mut files = FileMap::new();
        files.insert("package.json".to_string(), "{}".to_string());
        files.insert("src/pages/Index.tsx".to_string(), "export default 1".to_string());

        host.mount(&FileSystemTree::from_files(&files)).await.expect("mount");
        assert_eq!(host.read_file("package.json").await.expect("read"), "{}");
        host.write_file("package.json", "{\"a\":1}").await.expect("write");
        assert_eq!(host.read_file("/package.json").await.expect("read"), "{\"a\":1}");
        assert!(host.read_file("../outside").await.is_err());
    }

    #[tokio::test]
    async fn teardown_removes_directory_and_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let host = LocalSandboxHost::new(dir.path().join("session"));
        host.write_file("a.txt", "x").await.expect("write");
        host.teardown().await.expect("teardown");
        host.teardown().await.expect("second teardown");
        assert!(!host.dir.exists());
        assert!(matches!(host.write_file("a.txt", "x").await, Err(AppError::Sandbox(_))));
    }

    #[tokio::test]
    async fn missing_toolchain_is_reported_as_unsupported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let booter = LocalBooter::new(dir.path()).with_toolchain("definitely-not-a-real-binary-9d1c");
        let error = booter.boot().await.err().expect("boot fails");
        assert!(matches!(error, AppError::Unsupported(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_streams_output_and_exit_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let host = LocalSandboxHost::new(dir.path().to_path_buf());
        let args = vec![
            "-c".to_string(),
            "echo 'Local: http://localhost:4321/'; echo oops 1>&2; exit 3".to_string(),
        ];
        let mut process = host.spawn("sh", &args).await.expect("spawn");

        let mut output = String::new();
        while let Some(chunk) = process.output.recv().await {
            output.push_str(&chunk);
        }
        assert!(output.contains("oops"));
        assert_eq!(process.exit.await.expect("exit"), 3);
        assert_eq!(process.ready.recv().await.expect("ready").port, 4321);
        assert!(host.children.lock().await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn server_ready_is_scoped_to_the_announcing_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let host = LocalSandboxHost::new(dir.path().to_path_buf());
        let quiet_args = vec!["-c".to_string(), "exec sleep 5".to_string()];
        let serving_args = vec!["-c".to_string(), "echo 'Local: http://localhost:4400/'".to_string()];

        let mut quiet = host.spawn("sh", &quiet_args).await.expect("spawn quiet");
        let mut serving = host.spawn("sh", &serving_args).await.expect("spawn serving");
        assert_eq!(host.children.lock().await.len(), 2);

        assert_eq!(serving.ready.recv().await.expect("ready").port, 4400);
        assert_eq!(serving.exit.await.expect("exit"), 0);
        assert!(quiet.ready.try_recv().is_err());
        assert_eq!(host.children.lock().await.len(), 1);

        host.teardown().await.expect("teardown");
        assert!(quiet.ready.recv().await.is_none());
    }
}
