//! Lifecycle supervision for the media service child process.
//!
//! The streaming engine ships as a separate executable next to the host
//! binary. The supervisor launches it, mirrors its stdio into the log
//! sink, relaunches it on unplanned exits, and sweeps the whole process
//! group on teardown so helper processes it spawned do not outlive the
//! host.

use crate::logsink::LogSink;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Environment variable the runtime loader reads to find its manifest.
const RUNTIME_MANIFEST_ENV: &str = "XR_RUNTIME_JSON";
/// Subtree searched for runtime manifests, relative to the install root.
const RELEASES_DIR: &str = "releases";

/// Status lines the service prints continuously; mirroring them would
/// drown the log sink.
const NOISY_LINE_PREFIXES: &[&str] = &[
    "CurrentState:",
    "Heartbeat",
    "Waiting for connection",
    "Polling adapter",
];

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub executable: PathBuf,
    /// Directory whose `releases/` subtree holds runtime manifests.
    /// Defaults to the executable's directory.
    pub install_root: PathBuf,
}

impl SupervisorConfig {
    pub fn for_executable(executable: PathBuf) -> Self {
        let install_root = executable
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            executable,
            install_root,
        }
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("media service executable not found at {0:?}")]
    MissingExecutable(PathBuf),
    #[error("failed to launch media service: {0}")]
    Spawn(std::io::Error),
}

#[derive(Debug)]
pub struct ProcessSupervisor {
    shutting_down: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ProcessSupervisor {
    /// Launch the child and start supervising it. Kills any stale
    /// instance of the same executable left over from a previous crash
    /// before launching.
    pub async fn launch(
        config: SupervisorConfig,
        sink: Arc<dyn LogSink>,
    ) -> Result<Self, SupervisorError> {
        if !config.executable.is_file() {
            return Err(SupervisorError::MissingExecutable(config.executable));
        }

        kill_stale_instances(&config.executable);

        let manifest = find_runtime_manifest(&config.install_root.join(RELEASES_DIR));
        let shutting_down = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let first = spawn_child(&config, manifest.as_deref()).map_err(SupervisorError::Spawn)?;

        let task = tokio::spawn(supervise(
            config,
            manifest,
            first,
            Arc::clone(&sink),
            Arc::clone(&shutting_down),
            cancel.clone(),
        ));

        Ok(Self {
            shutting_down,
            cancel,
            task,
        })
    }

    /// Deterministic teardown. The flag is set before anything else so
    /// the exit watcher cannot mistake the kill for a crash and relaunch.
    pub async fn shutdown(self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!(error = %err, "supervisor task did not shut down cleanly");
        }
    }
}

async fn supervise(
    config: SupervisorConfig,
    manifest: Option<PathBuf>,
    first: Child,
    sink: Arc<dyn LogSink>,
    shutting_down: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut child = Some(first);
    loop {
        let mut current = match child.take() {
            Some(running) => running,
            None => match spawn_child(&config, manifest.as_deref()) {
                Ok(spawned) => spawned,
                Err(err) => {
                    warn!(error = %err, "media service relaunch failed; supervision stopped");
                    sink.append(&format!("media service relaunch failed: {err}"));
                    return;
                }
            },
        };

        let pid = current.id();
        info!(pid, executable = %config.executable.display(), "media service running");
        forward_stdio(&mut current, Arc::clone(&sink));

        tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(err) = current.start_kill() {
                    debug!(error = %err, "kill on shutdown failed (already exited?)");
                }
                let _ = current.wait().await;
                sweep_process_group(pid);
                return;
            }
            status = current.wait() => {
                // The handle is dropped here; we never keep one to an
                // exited process.
                drop(current);
                if shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                let code = status
                    .ok()
                    .and_then(|status| status.code());
                warn!(?code, "media service exited unexpectedly; relaunching");
                sink.append(&format!(
                    "media service exited unexpectedly (code {code:?}); relaunching"
                ));
            }
        }
    }
}

fn spawn_child(
    config: &SupervisorConfig,
    manifest: Option<&Path>,
) -> std::io::Result<Child> {
    let mut command = Command::new(&config.executable);
    command
        .current_dir(&config.install_root)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    if let Some(manifest) = manifest {
        command.env(RUNTIME_MANIFEST_ENV, manifest);
    }
    #[cfg(unix)]
    {
        // Own group, so teardown can sweep descendants in one signal.
        command.process_group(0);
    }
    command.spawn()
}

fn forward_stdio(child: &mut Child, sink: Arc<dyn LogSink>) {
    if let Some(stdout) = child.stdout.take() {
        let sink = Arc::clone(&sink);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if is_noise(&line) {
                    continue;
                }
                debug!(target: "pier::media_service", "{line}");
                sink.append(&format!("media-service: {line}"));
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if is_noise(&line) {
                    continue;
                }
                warn!(target: "pier::media_service", "{line}");
                sink.append(&format!("media-service! {line}"));
            }
        });
    }
}

fn is_noise(line: &str) -> bool {
    let trimmed = line.trim_start();
    NOISY_LINE_PREFIXES
        .iter()
        .any(|prefix| trimmed.starts_with(prefix))
}

/// Locate the runtime manifest under the `releases/` subtree. The full
/// candidate list is sorted lexicographically by path before picking the
/// first, so the choice is stable across filesystems; a warning names
/// the candidates that lost.
pub fn find_runtime_manifest(releases_root: &Path) -> Option<PathBuf> {
    let mut candidates = Vec::new();
    collect_manifests(releases_root, &mut candidates);
    candidates.sort();
    if candidates.len() > 1 {
        warn!(
            chosen = %candidates[0].display(),
            others = candidates.len() - 1,
            "multiple runtime manifests under releases/; using the first"
        );
    }
    candidates.into_iter().next()
}

fn collect_manifests(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_manifests(&path, out);
        } else if path.extension().is_some_and(|ext| ext == "json") {
            out.push(path);
        }
    }
}

/// Kill any prior instance of the executable left behind by a crashed
/// host. Linux-only; other platforms rely on the stale instance exiting
/// on its own when its control socket goes away.
#[cfg(target_os = "linux")]
fn kill_stale_instances(executable: &Path) {
    let target = match executable.canonicalize() {
        Ok(path) => path,
        Err(_) => return,
    };
    let own_pid = std::process::id();
    let proc_dir = match std::fs::read_dir("/proc") {
        Ok(dir) => dir,
        Err(_) => return,
    };
    for entry in proc_dir.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        if pid == own_pid {
            continue;
        }
        let exe_link = entry.path().join("exe");
        if let Ok(exe) = std::fs::read_link(&exe_link) {
            if exe == target {
                warn!(pid, "killing stale media service instance");
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGKILL);
                }
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn kill_stale_instances(_executable: &Path) {}

#[cfg(unix)]
fn sweep_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            // The child was its own group leader; negative pid targets
            // the whole group.
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn sweep_process_group(_pid: Option<u32>) {}
