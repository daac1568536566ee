//! OS process primitives: spawning with redirected logs, signal delivery,
//! bounded shutdown and discovery of stray same-binary processes.

use std::fs::{self, File, OpenOptions};
use std::future::Future;
use std::io;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::errors::{HarnessError, HarnessResult};
use crate::poll::wait_for_value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    /// Graceful shutdown request (`SIGTERM`).
    Terminate,
    /// Forceful termination (`SIGKILL`).
    Kill,
    /// Interactive interrupt (`SIGINT`).
    Interrupt,
}

impl Signal {
    #[cfg(unix)]
    fn raw(self) -> libc::c_int {
        match self {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
            Signal::Interrupt => libc::SIGINT,
        }
    }
}

/// Delivers `signal` to `pid`. Returns `Ok(false)` when no such process exists.
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: Signal) -> HarnessResult<bool> {
    let result = unsafe { libc::kill(pid as libc::pid_t, signal.raw()) };
    if result == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(HarnessError::process(
            format!("pid {pid}"),
            format!("failed to deliver {signal:?}: {err}"),
        ))
    }
}

#[cfg(not(unix))]
pub fn send_signal(pid: u32, signal: Signal) -> HarnessResult<bool> {
    Err(HarnessError::process(
        format!("pid {pid}"),
        format!("{signal:?} delivery is only supported on unix"),
    ))
}

/// Everything needed to (re)start one managed process.
#[derive(Clone, Debug)]
pub struct ProcessSpec {
    pub label: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

impl ProcessSpec {
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// A child process owned by this run; killed when dropped.
#[derive(Debug)]
pub struct ManagedProcess {
    label: String,
    pid: u32,
    child: Child,
    exit_status: Option<ExitStatus>,
}

impl ManagedProcess {
    /// Spawns the process with stdout and stderr appended to the log files named in `spec`.
    pub fn spawn(spec: &ProcessSpec) -> HarnessResult<Self> {
        let stdout = open_log(&spec.stdout_path)?;
        let stderr = open_log(&spec.stderr_path)?;
        debug!(target = "harness::process", label = %spec.label, cmd = %spec.command_line(), "spawning process");

        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                HarnessError::process(
                    spec.label.clone(),
                    format!("failed to spawn {}: {err}", spec.program.display()),
                )
            })?;
        let pid = child.id().ok_or_else(|| {
            HarnessError::process(spec.label.clone(), "process exited before reporting a pid")
        })?;
        Ok(Self {
            label: spec.label.clone(),
            pid,
            child,
            exit_status: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Exit status if the process has terminated, without blocking.
    pub fn try_exit_status(&mut self) -> HarnessResult<Option<ExitStatus>> {
        if self.exit_status.is_some() {
            return Ok(self.exit_status);
        }
        let status = self.child.try_wait().map_err(|err| {
            HarnessError::process(self.label.clone(), format!("failed to poll status: {err}"))
        })?;
        self.exit_status = status;
        Ok(status)
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.try_exit_status(), Ok(None))
    }

    /// Sends `signal` without waiting; a no-op once the process has exited.
    pub fn signal(&mut self, signal: Signal) -> HarnessResult<()> {
        if !self.is_running() {
            return Ok(());
        }
        #[cfg(unix)]
        {
            send_signal(self.pid, signal).map(|_| ())
        }
        #[cfg(not(unix))]
        {
            let _ = signal;
            self.child.start_kill().map_err(|err| {
                HarnessError::process(self.label.clone(), format!("failed to kill: {err}"))
            })
        }
    }

    /// Sends `signal` and waits up to `grace` for the process to exit,
    /// escalating to a forceful kill afterwards.
    pub async fn stop(&mut self, signal: Signal, grace: Duration) -> HarnessResult<ExitStatus> {
        if let Some(status) = self.try_exit_status()? {
            return Ok(status);
        }
        self.signal(signal)?;
        match timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exit_status = Some(status);
                Ok(status)
            }
            Ok(Err(err)) => Err(HarnessError::process(
                self.label.clone(),
                format!("failed to reap process: {err}"),
            )),
            Err(_) => {
                warn!(
                    target = "harness::process",
                    label = %self.label,
                    pid = self.pid,
                    ?grace,
                    "process ignored {signal:?}, killing"
                );
                self.child.start_kill().map_err(|err| {
                    HarnessError::process(self.label.clone(), format!("failed to kill: {err}"))
                })?;
                let status = self.child.wait().await.map_err(|err| {
                    HarnessError::process(self.label.clone(), format!("failed to reap process: {err}"))
                })?;
                self.exit_status = Some(status);
                Ok(status)
            }
        }
    }
}

/// Polls `probe` until it reports ready, failing early if `process` exits.
pub async fn wait_for_ready<F, Fut>(
    process: &mut ManagedProcess,
    mut probe: F,
    ready_timeout: Duration,
    interval: Duration,
) -> HarnessResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let label = process.label().to_string();
    let outcome = wait_for_value(
        || {
            let exited = match process.try_exit_status() {
                Ok(Some(status)) => Some(Err(HarnessError::process(
                    label.clone(),
                    format!("exited prematurely with status {status}"),
                ))),
                Ok(None) => None,
                Err(err) => Some(Err(err)),
            };
            let ready = probe();
            async move {
                match exited {
                    Some(failure) => Some(failure),
                    None => ready.await.then_some(Ok(())),
                }
            }
        },
        ready_timeout,
        interval,
    )
    .await;
    outcome.unwrap_or_else(|| {
        Err(HarnessError::Timeout {
            what: format!("{label} to become ready"),
            timeout: ready_timeout,
        })
    })
}

fn open_log(path: &Path) -> HarnessResult<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// Reserves a free TCP port on `host` by binding and immediately releasing it.
pub fn random_port(host: &str) -> HarnessResult<u16> {
    let listener = TcpListener::bind((host, 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Pids of running processes whose executable name is `binary_name`,
/// excluding the current process.
pub fn find_processes_by_name(binary_name: &str) -> Vec<u32> {
    let own_pid = std::process::id();
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter(|pid| *pid != own_pid)
        .filter(|pid| executable_name(*pid).as_deref() == Some(binary_name))
        .collect()
}

fn executable_name(pid: u32) -> Option<String> {
    let cmdline = fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    let argv0 = cmdline.split(|byte| *byte == 0).next()?;
    let argv0 = std::str::from_utf8(argv0).ok()?;
    Path::new(argv0)
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
}

/// Forcefully kills every process running `binary_name` that is not in `exclude`.
/// Returns the number of processes signalled.
pub fn kill_unmanaged(binary_name: &str, exclude: &[u32]) -> usize {
    let mut killed = 0;
    for pid in find_processes_by_name(binary_name) {
        if exclude.contains(&pid) {
            continue;
        }
        match send_signal(pid, Signal::Kill) {
            Ok(true) => {
                warn!(target = "harness::process", pid, binary = binary_name, "killed unmanaged process");
                killed += 1;
            }
            Ok(false) => {}
            Err(err) => {
                warn!(target = "harness::process", pid, error = %err, "failed to kill unmanaged process");
            }
        }
    }
    killed
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sleeper(dir: &Path, seconds: &str) -> ProcessSpec {
        ProcessSpec {
            label: "sleeper".to_string(),
            program: PathBuf::from("sleep"),
            args: vec![seconds.to_string()],
            stdout_path: dir.join("stdout.txt"),
            stderr_path: dir.join("stderr.txt"),
        }
    }

    #[tokio::test]
    async fn terminate_stops_process_and_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut process = ManagedProcess::spawn(&sleeper(dir.path(), "30")).expect("spawn");
        assert!(process.is_running());

        let status = process
            .stop(Signal::Terminate, Duration::from_secs(5))
            .await
            .expect("stop");
        assert!(!status.success());
        assert!(!process.is_running());

        // second stop must not fail on an already reaped process
        process
            .stop(Signal::Kill, Duration::from_secs(1))
            .await
            .expect("second stop");
        assert!(dir.path().join("stderr.txt").exists());
    }

    #[tokio::test]
    async fn readiness_fails_fast_when_process_exits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut process = ManagedProcess::spawn(&sleeper(dir.path(), "0")).expect("spawn");
        let err = wait_for_ready(
            &mut process,
            || async { false },
            Duration::from_secs(10),
            Duration::from_millis(20),
        )
        .await
        .expect_err("process exits immediately");
        assert!(matches!(err, HarnessError::Process { .. }), "{err}");
    }

    #[tokio::test]
    async fn readiness_reports_timeout_while_process_lives() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut process = ManagedProcess::spawn(&sleeper(dir.path(), "30")).expect("spawn");
        let err = wait_for_ready(
            &mut process,
            || async { false },
            Duration::from_millis(150),
            Duration::from_millis(20),
        )
        .await
        .expect_err("probe never succeeds");
        assert!(matches!(err, HarnessError::Timeout { .. }), "{err}");

        let mut checks = 0;
        wait_for_ready(
            &mut process,
            || {
                checks += 1;
                let ready = checks >= 3;
                async move { ready }
            },
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .await
        .expect("ready on third check");
        assert_eq!(checks, 3);
        process
            .stop(Signal::Kill, Duration::from_secs(1))
            .await
            .expect("stop");
    }

    #[test]
    fn signalling_missing_pid_reports_false() {
        // pid_max on linux never reaches this value
        assert!(!send_signal(i32::MAX as u32, Signal::Terminate).expect("signal"));
    }

    #[test]
    fn unknown_binaries_have_no_processes() {
        assert!(find_processes_by_name("no-such-harness-binary").is_empty());
    }

    #[test]
    fn random_ports_are_nonzero() {
        assert_ne!(random_port("127.0.0.1").expect("port"), 0);
    }
}
