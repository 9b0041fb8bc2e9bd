/*!
 * OBEX Supervisor
 * Starts and stops the obexd file-transfer daemon as a detached child
 */

use std::ffi::OsStr;
use std::fs::{self, DirBuilder, Permissions};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub const OBEX_DAEMON: &str = "obexd";

const RECEIVE_DIR_MODE: u32 = 0o755;
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_POLL: Duration = Duration::from_millis(100);
// TASK_COMM_LEN minus the trailing NUL
const COMM_LEN: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObexState {
    Stopped,
    /// `receive_dir` is only known for a daemon this supervisor started.
    Running { pid: u32, receive_dir: Option<PathBuf> },
}

pub struct ObexSupervisor {
    binary: PathBuf,
    comm: String,
    started: Mutex<Option<Daemon>>,
}

/// The daemon this supervisor spawned, kept so it can be reaped.
struct Daemon {
    child: Child,
    receive_dir: PathBuf,
}

impl Default for ObexSupervisor {
    fn default() -> Self {
        Self::with_binary(OBEX_DAEMON)
    }
}

impl ObexSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Supervises `binary` (looked up on `PATH` when it has no directory part).
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        let binary = binary.into();
        let comm: String = binary
            .file_name()
            .and_then(OsStr::to_str)
            .unwrap_or(OBEX_DAEMON)
            .chars()
            .take(COMM_LEN)
            .collect();
        Self {
            binary,
            comm,
            started: Mutex::new(None),
        }
    }

    /// Idempotent: starting a running daemon or stopping a stopped one is a no-op.
    pub async fn control(&self, start: bool, receive_dir: &Path) -> Result<()> {
        self.reap();
        let running = self.running_pids()?;
        match (start, running.is_empty()) {
            (true, false) => {
                debug!("{} is already running [PID: {:?}]", self.comm, running);
                Ok(())
            }
            (false, true) => {
                debug!("{} is already stopped", self.comm);
                Ok(())
            }
            (true, true) => self.start(receive_dir),
            (false, false) => self.stop(running).await,
        }
    }

    pub fn state(&self) -> Result<ObexState> {
        let running = self.running_pids()?;
        let Some(&first) = running.first() else {
            return Ok(ObexState::Stopped);
        };
        let ours = self
            .started()
            .as_ref()
            .map(|daemon| (daemon.child.id(), daemon.receive_dir.clone()));
        if let Some((pid, dir)) = ours {
            if running.contains(&pid) {
                return Ok(ObexState::Running { pid, receive_dir: Some(dir) });
            }
        }
        Ok(ObexState::Running { pid: first, receive_dir: None })
    }

    /// Live (non-zombie) processes named like the daemon.
    pub fn running_pids(&self) -> Result<Vec<u32>> {
        find_processes(&self.comm)
            .map_err(|e| Error::Process(format!("failed to probe for {}: {}", self.comm, e)))
    }

    fn start(&self, receive_dir: &Path) -> Result<()> {
        ensure_receive_dir(receive_dir)?;

        debug!("Starting {}...", self.comm);
        let child = Command::new(&self.binary)
            .arg("-a")
            .arg("-r")
            .arg(receive_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|e| {
                Error::Process(format!("failed to start {}: {}", self.binary.display(), e))
            })?;

        let pid = child.id();
        info!("{} [PID: {}] started, receiving into {}", self.comm, pid, receive_dir.display());
        *self.started() = Some(Daemon {
            child,
            receive_dir: receive_dir.to_path_buf(),
        });
        Ok(())
    }

    async fn stop(&self, pids: Vec<u32>) -> Result<()> {
        debug!("Stopping {} [PID: {:?}]...", self.comm, pids);
        for &pid in &pids {
            let target = i32::try_from(pid)
                .map_err(|_| Error::Process(format!("PID {} out of range", pid)))?;
            match kill(Pid::from_raw(target), Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => {
                    return Err(Error::Process(format!(
                        "failed to stop {} [PID: {}]: {}",
                        self.comm, pid, e
                    )))
                }
            }
        }

        let deadline = Instant::now() + STOP_TIMEOUT;
        loop {
            let reaped = self.reap();
            let remaining = self.running_pids()?;
            if remaining.is_empty() && reaped {
                info!("{} [PID: {:?}] stopped", self.comm, pids);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Process(format!(
                    "{} still running after SIGTERM [PID: {:?}]",
                    self.comm, remaining
                )));
            }
            time::sleep(STOP_POLL).await;
        }
    }

    /// Collects our daemon's exit status once it has exited. True when
    /// nothing of ours is left to wait for.
    fn reap(&self) -> bool {
        let mut started = self.started();
        let Some(daemon) = started.as_mut() else {
            return true;
        };
        let pid = daemon.child.id();
        let done = match daemon.child.try_wait() {
            Ok(Some(status)) => {
                debug!("{} [PID: {}] exited: {}", self.comm, pid, status);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Failed to wait for {} [PID: {}]: {}", self.comm, pid, e);
                true
            }
        };
        if done {
            *started = None;
        }
        done
    }

    fn started(&self) -> std::sync::MutexGuard<'_, Option<Daemon>> {
        self.started.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn ensure_receive_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    DirBuilder::new()
        .recursive(true)
        .mode(RECEIVE_DIR_MODE)
        .create(dir)?;
    // the umask may have narrowed the mode
    fs::set_permissions(dir, Permissions::from_mode(RECEIVE_DIR_MODE))?;
    debug!("Created receive directory {}", dir.display());
    Ok(())
}

fn find_processes(comm: &str) -> std::io::Result<Vec<u32>> {
    let mut pids = Vec::new();
    for entry in fs::read_dir("/proc")? {
        let entry = entry?;
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        // processes can vanish mid-scan
        let Ok(stat) = fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some((name, state)) = parse_stat(&stat) {
            if name == comm && !matches!(state, 'Z' | 'X') {
                pids.push(pid);
            }
        }
    }
    pids.sort_unstable();
    Ok(pids)
}

/// Command name and state letter from a `/proc/<pid>/stat` line.
fn parse_stat(stat: &str) -> Option<(&str, char)> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let name = stat.get(open + 1..close)?;
    let state = stat.get(close + 1..)?.trim_start().chars().next()?;
    Some((name, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn fake_daemon(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\nwhile :; do sleep 1; done\n").unwrap();
        fs::set_permissions(&path, Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn parses_stat_lines() {
        assert_eq!(parse_stat("812 (obexd) S 1 812 812 0 -1"), Some(("obexd", 'S')));
        assert_eq!(parse_stat("99 (odd) name)) Z 1 99"), Some(("odd) name)", 'Z')));
        assert_eq!(parse_stat("garbage"), None);
    }

    #[test]
    fn comm_is_truncated_like_the_kernel() {
        let supervisor = ObexSupervisor::with_binary("/usr/libexec/bluetooth/obexd");
        assert_eq!(supervisor.comm, "obexd");
        let supervisor = ObexSupervisor::with_binary("a-very-long-daemon-name");
        assert_eq!(supervisor.comm, "a-very-long-dae");
    }

    #[tokio::test]
    #[serial]
    async fn stopping_a_stopped_daemon_is_a_no_op() {
        let supervisor = ObexSupervisor::with_binary("pt-never-runs");
        supervisor.control(false, Path::new("")).await.unwrap();
        supervisor.control(false, Path::new("")).await.unwrap();
        assert_eq!(supervisor.state().unwrap(), ObexState::Stopped);
    }

    #[tokio::test]
    #[serial]
    async fn start_creates_receive_dir_with_0755() {
        let tmp = tempfile::tempdir().unwrap();
        let receive_dir = tmp.path().join("obex").join("in");
        let supervisor = ObexSupervisor::with_binary(tmp.path().join("pt-missing-bin"));

        let err = supervisor.control(true, &receive_dir).await.unwrap_err();

        assert!(matches!(err, Error::Process(_)));
        let mode = fs::metadata(&receive_dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[tokio::test]
    #[serial]
    async fn uncreatable_receive_dir_is_io_error() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("file");
        fs::write(&blocker, b"").unwrap();
        let supervisor = ObexSupervisor::with_binary(tmp.path().join("pt-missing-bin"));

        let err = supervisor.control(true, &blocker.join("in")).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    #[serial]
    async fn daemon_lifecycle_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let receive_dir = tmp.path().join("obex-in");
        let supervisor = ObexSupervisor::with_binary(fake_daemon(tmp.path(), "pt-obexd-life"));

        supervisor.control(true, &receive_dir).await.unwrap();
        supervisor.control(true, &receive_dir).await.unwrap();

        assert!(receive_dir.is_dir());
        assert_eq!(supervisor.running_pids().unwrap().len(), 1);
        let pid = match supervisor.state().unwrap() {
            ObexState::Running { pid, receive_dir: dir } => {
                assert_eq!(dir.as_deref(), Some(receive_dir.as_path()));
                pid
            }
            other => panic!("expected running daemon, got {:?}", other),
        };

        supervisor.control(false, Path::new("")).await.unwrap();
        supervisor.control(false, Path::new("")).await.unwrap();
        assert!(supervisor.running_pids().unwrap().is_empty());
        assert_eq!(supervisor.state().unwrap(), ObexState::Stopped);
        // reaped, not left behind as a zombie
        assert!(!Path::new(&format!("/proc/{}", pid)).exists());
    }
}
