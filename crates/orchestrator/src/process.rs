//! Suite process management
//!
//! Spawns the Playwright suite in its own process group and turns its output
//! into a stream of [`RunnerEvent`]s on a bounded channel. Two reader tasks
//! (stdout, stderr) and one supervisor task feed the channel; the controller's
//! dispatcher is the only consumer.

use playdeck_common::{Channel, Error, Result, RunConfig, RunId};
use std::collections::BTreeMap;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{OrchestratorConfig, SuiteConfig};

/// Evidence that a suite process is done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Both stdout and stderr reached EOF
    StreamsClosed,
    /// The process exited
    Exited,
}

/// Messages from a running suite to the dispatcher
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    Line {
        run_id: RunId,
        channel: Channel,
        text: String,
    },
    Terminated {
        run_id: RunId,
        signal: Termination,
        exit_code: Option<i32>,
    },
}

/// Handle to a spawned suite; the pid doubles as the process group id.
#[derive(Debug, Clone, Copy)]
pub struct SuiteProcess {
    pid: u32,
}

impl SuiteProcess {
    /// SIGKILL the whole process group (the suite forks its own workers).
    pub fn kill_tree(&self) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        info!("Killing suite process group {}", self.pid);
        match killpg(Pid::from_raw(self.pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(Error::Internal(format!(
                "failed to kill process group {}: {}",
                self.pid, e
            ))),
        }
    }
}

/// Spawns the suite for a run configuration
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    config: OrchestratorConfig,
}

impl ProcessRunner {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn suite(&self) -> &SuiteConfig {
        &self.config.suite
    }

    /// Command line arguments: base args, reporter, then one filter per script
    pub fn build_args(&self, config: &RunConfig) -> Vec<String> {
        let mut args = self.suite().args.clone();
        if let Some(reporter) = &self.suite().reporter_arg {
            args.push(reporter.clone());
        }
        args.extend(config.scripts.iter().cloned());
        args
    }

    /// Environment layered on top of the parent's
    pub fn build_env(&self, config: &RunConfig) -> BTreeMap<String, String> {
        let mut env = self.suite().env.clone();

        env.insert("REGION".to_string(), config.region.code().to_string());
        if let Some(base_url) = self.config.base_url(config.region) {
            env.insert("BASE_URL".to_string(), base_url.to_string());
        }
        // Plain output keeps classification regexes simple.
        env.insert("FORCE_COLOR".to_string(), "0".to_string());

        for (key, value) in &config.env {
            env.insert(key.clone(), value.clone());
        }
        env
    }

    /// Spawn the suite and start streaming its output into `tx`.
    pub fn spawn(
        &self,
        run_id: RunId,
        config: &RunConfig,
        tx: mpsc::Sender<RunnerEvent>,
    ) -> Result<SuiteProcess> {
        self.clear_stale_report()?;

        let args = self.build_args(config);
        info!(
            "Spawning suite for run {}: {} {}",
            run_id,
            self.suite().command,
            args.join(" ")
        );

        let mut std_cmd = std::process::Command::new(&self.suite().command);
        std_cmd
            .args(&args)
            .envs(self.build_env(config))
            .current_dir(&self.suite().working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        let mut cmd = Command::from(std_cmd);
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::Spawn(format!(
                "{} (in {}): {}",
                self.suite().command,
                self.suite().working_dir.display(),
                e
            ))
        })?;

        let pid = child
            .id()
            .ok_or_else(|| Error::Spawn("suite exited before it could be tracked".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Spawn("stderr not captured".to_string()))?;

        let stdout_task = tokio::spawn(read_lines(run_id, Channel::Stdout, stdout, tx.clone()));
        let stderr_task = tokio::spawn(read_lines(run_id, Channel::Stderr, stderr, tx.clone()));
        tokio::spawn(supervise(
            run_id,
            child,
            stdout_task,
            stderr_task,
            tx,
            self.config.termination_grace(),
        ));

        debug!("Suite for run {} running as pid {}", run_id, pid);
        Ok(SuiteProcess { pid })
    }

    /// A report file left by an earlier run must never be read as this run's.
    fn clear_stale_report(&self) -> Result<()> {
        let Some(path) = self.suite().report_file_path() else {
            return Ok(());
        };
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed previous report {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Spawn(format!(
                "cannot clear previous report {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Script ids available in the suite's specs directory
    pub fn discover_scripts(&self) -> Vec<String> {
        let root: PathBuf = self.suite().specs_path();
        if !root.is_dir() {
            debug!("Specs directory {} not found", root.display());
            return Vec::new();
        }

        let suffix = self.suite().spec_suffix.as_str();
        let mut scripts: Vec<String> = WalkDir::new(&root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy();
                name.strip_suffix(suffix)
                    .filter(|stem| !stem.is_empty())
                    .map(str::to_string)
            })
            .collect();

        scripts.sort();
        scripts.dedup();
        scripts
    }
}

async fn read_lines<R>(run_id: RunId, channel: Channel, stream: R, tx: mpsc::Sender<RunnerEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                let event = RunnerEvent::Line {
                    run_id,
                    channel,
                    text,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Reading suite {} for run {} failed: {}", channel, run_id, e);
                break;
            }
        }
    }
}

/// Report both termination signals, in the order they happen.
///
/// The first signal is held back for up to `grace` so it can carry the exit
/// code (streams closed first) or follow the drained output (exit first).
async fn supervise(
    run_id: RunId,
    mut child: Child,
    stdout: JoinHandle<()>,
    stderr: JoinHandle<()>,
    tx: mpsc::Sender<RunnerEvent>,
    grace: Duration,
) {
    let mut readers = Box::pin(async move {
        let _ = tokio::join!(stdout, stderr);
    });
    let mut readers_done = false;
    let mut exit_code: Option<i32> = None;
    let mut exited = false;

    let first = tokio::select! {
        _ = &mut readers => {
            readers_done = true;
            Termination::StreamsClosed
        }
        status = child.wait() => {
            exited = true;
            exit_code = status.ok().and_then(|s| s.code());
            Termination::Exited
        }
    };

    if !exited {
        if let Ok(status) = timeout(grace, child.wait()).await {
            exited = true;
            exit_code = status.ok().and_then(|s| s.code());
        }
    }
    if !readers_done && timeout(grace, &mut readers).await.is_ok() {
        readers_done = true;
    }

    debug!("Run {} terminated ({:?}, exit {:?})", run_id, first, exit_code);
    let _ = tx
        .send(RunnerEvent::Terminated {
            run_id,
            signal: first,
            exit_code,
        })
        .await;

    if !exited {
        exit_code = child.wait().await.ok().and_then(|s| s.code());
    }
    if !readers_done {
        readers.await;
    }

    let second = match first {
        Termination::StreamsClosed => Termination::Exited,
        Termination::Exited => Termination::StreamsClosed,
    };
    let _ = tx
        .send(RunnerEvent::Terminated {
            run_id,
            signal: second,
            exit_code,
        })
        .await;
}
