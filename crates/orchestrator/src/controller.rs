//! Run controller
//!
//! Owns the single run slot and drives a run through
//! `Idle → Running → Finalizing → Idle`. All transitions happen under one
//! mutex that is never held across an `.await`; lifecycle events are emitted
//! while it is held so observers see them in slot order.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use playdeck_common::{
    ControllerStatus, Error, Result, RunConfig, RunEvent, RunId, RunRecord, RunStatus,
};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::classify::OutputCapture;
use crate::config::OrchestratorConfig;
use crate::events::EventBroadcaster;
use crate::history::HistoryStore;
use crate::parser::{determine_status, parse_results};
use crate::process::{ProcessRunner, RunnerEvent, SuiteProcess};

const STOP_REASON: &str = "stopped by request";

/// In-memory handle for the run occupying the slot
struct ActiveRun {
    run_id: RunId,
    config: RunConfig,
    timestamp: DateTime<Utc>,
    started: Instant,
    process: SuiteProcess,
    output: OutputCapture,
}

enum Slot {
    Idle,
    Running(Box<ActiveRun>),
    /// Terminal record is being built; the slot is still taken.
    Finalizing(RunId),
}

struct State {
    slot: Slot,
    last_run_id: Option<RunId>,
}

impl State {
    fn next_run_id(&mut self) -> RunId {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let id = match self.last_run_id {
            Some(RunId(last)) => RunId(now.max(last + 1)),
            None => RunId(now),
        };
        self.last_run_id = Some(id);
        id
    }

    /// Move a running run into Finalizing, handing back its handle.
    fn take_running(&mut self, run_id: Option<RunId>) -> Option<Box<ActiveRun>> {
        let matches = match &self.slot {
            Slot::Running(active) => run_id.map_or(true, |id| active.run_id == id),
            _ => false,
        };
        if !matches {
            return None;
        }
        let Slot::Running(active) = std::mem::replace(&mut self.slot, Slot::Idle) else {
            return None;
        };
        self.slot = Slot::Finalizing(active.run_id);
        Some(active)
    }
}

struct Inner {
    config: OrchestratorConfig,
    state: Mutex<State>,
    runner: ProcessRunner,
    history: Arc<HistoryStore>,
    events: EventBroadcaster,
    tx: mpsc::Sender<RunnerEvent>,
}

/// Handle to the orchestrator; cheap to clone.
#[derive(Clone)]
pub struct RunController {
    inner: Arc<Inner>,
}

impl RunController {
    /// Open history and start the dispatcher. Must be called from within a
    /// tokio runtime.
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        std::fs::create_dir_all(config.reports_dir())?;
        let history = Arc::new(HistoryStore::open(config.history_path())?);
        let latest = history.latest().map(|r| r.run_id);

        let (tx, rx) = mpsc::channel(config.line_channel_capacity.max(1));
        let inner = Arc::new(Inner {
            runner: ProcessRunner::new(&config),
            events: EventBroadcaster::new(config.event_capacity),
            state: Mutex::new(State {
                slot: Slot::Idle,
                last_run_id: latest,
            }),
            history,
            tx,
            config,
        });

        tokio::spawn(dispatch(Arc::downgrade(&inner), rx));
        info!(
            "Run controller ready (data dir {})",
            inner.config.data_dir.display()
        );

        Ok(Self { inner })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Start a run. Fails if the slot is taken, including while the previous
    /// run is still finalizing.
    pub fn start(&self, config: RunConfig) -> Result<RunId> {
        config.validate()?;

        let mut state = self.inner.state.lock();
        match &state.slot {
            Slot::Running(active) => {
                return Err(Error::AlreadyRunning {
                    run_id: active.run_id,
                })
            }
            Slot::Finalizing(run_id) => return Err(Error::AlreadyRunning { run_id: *run_id }),
            Slot::Idle => {}
        }

        let run_id = state.next_run_id();
        let process = self
            .inner
            .runner
            .spawn(run_id, &config, self.inner.tx.clone())
            .map_err(|e| {
                error!("Run {} could not start: {}", run_id, e);
                e
            })?;

        info!(
            "Run {} started: region {} scripts [{}]",
            run_id,
            config.region,
            config.scripts.join(", ")
        );
        state.slot = Slot::Running(Box::new(ActiveRun {
            run_id,
            config: config.clone(),
            timestamp: Utc::now(),
            started: Instant::now(),
            process,
            output: OutputCapture::new(self.inner.config.log_excerpt_lines),
        }));
        self.inner.events.emit(RunEvent::Started { run_id, config });

        Ok(run_id)
    }

    /// Kill the active run and record it as stopped without waiting for the
    /// process to die.
    ///
    /// The record is finished on its own task, so the slot is freed even if
    /// the caller stops waiting.
    pub async fn stop(&self) -> Result<RunId> {
        let taken = self.inner.state.lock().take_running(None);
        let active = taken.ok_or(Error::NotRunning)?;

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.finish_stopped(active).await })
            .await
            .map_err(|e| Error::Internal(format!("stop task failed: {}", e)))
    }

    /// Start again with a historical run's exact configuration.
    pub fn rerun(&self, run_id: RunId) -> Result<RunId> {
        let record = self
            .inner
            .history
            .get(run_id)
            .ok_or_else(|| Error::run_not_found(run_id))?;
        debug!("Rerunning {}", run_id);
        self.start(record.config)
    }

    pub fn status(&self) -> ControllerStatus {
        match &self.inner.state.lock().slot {
            Slot::Idle => ControllerStatus::Idle,
            Slot::Running(active) => ControllerStatus::Running {
                run_id: active.run_id,
                config: active.config.clone(),
                started_at: active.timestamp,
                elapsed_ms: active.started.elapsed().as_millis() as u64,
            },
            Slot::Finalizing(run_id) => ControllerStatus::Finalizing { run_id: *run_id },
        }
    }

    pub fn history(&self) -> Vec<RunRecord> {
        self.inner.history.all()
    }

    pub fn latest(&self) -> Option<RunRecord> {
        self.inner.history.latest()
    }

    pub fn get(&self, run_id: RunId) -> Option<RunRecord> {
        self.inner.history.get(run_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.events.subscribe()
    }

    /// Script ids found in the suite's specs directory
    pub fn scripts(&self) -> Vec<String> {
        self.inner.runner.discover_scripts()
    }
}

impl Inner {
    async fn handle_event(&self, event: RunnerEvent) {
        match event {
            RunnerEvent::Line {
                run_id,
                channel,
                text,
            } => {
                let mut state = self.state.lock();
                let Slot::Running(active) = &mut state.slot else {
                    return;
                };
                if active.run_id != run_id {
                    return;
                }
                debug!(target: "suite", run = %run_id, %channel, "{}", text);
                if let Some(shown) = active.output.push(channel, &text) {
                    self.events.emit(RunEvent::Log {
                        run_id,
                        channel,
                        text: shown,
                    });
                }
            }
            RunnerEvent::Terminated {
                run_id,
                signal,
                exit_code,
            } => {
                let taken = self.state.lock().take_running(Some(run_id));
                let Some(active) = taken else {
                    debug!("Ignoring {:?} for inactive run {}", signal, run_id);
                    return;
                };
                debug!("Run {} terminated ({:?}, exit {:?})", run_id, signal, exit_code);
                self.finalize(active, exit_code).await;
            }
        }
    }

    async fn finish_stopped(&self, mut active: Box<ActiveRun>) -> RunId {
        let run_id = active.run_id;
        if let Err(e) = active.process.kill_tree() {
            warn!("Run {}: {}", run_id, e);
        }

        let report = active.output.take_report();
        let parsed = parse_results(
            &active.config.scripts,
            report.as_deref(),
            active.output.full_output(),
        );
        let record = RunRecord::new(
            run_id,
            active.timestamp,
            active.config.clone(),
            RunStatus::Stopped,
            parsed.scripts,
        )
        .with_duration_ms(active.started.elapsed().as_millis() as u64)
        .with_source(parsed.source)
        .with_log_excerpt(active.output.excerpt());

        let persist_error = self.persist(&record).await;

        let mut state = self.state.lock();
        self.events.emit(RunEvent::Stopped {
            run_id,
            reason: STOP_REASON.to_string(),
            record: Box::new(record),
            persist_error,
        });
        state.slot = Slot::Idle;
        drop(state);

        info!("Run {} stopped", run_id);
        run_id
    }

    async fn finalize(&self, mut active: Box<ActiveRun>, exit_code: Option<i32>) {
        let run_id = active.run_id;
        let duration_ms = active.started.elapsed().as_millis() as u64;

        let (report, report_path) = self.archive_report(run_id, &mut active.output).await;
        let parsed = parse_results(
            &active.config.scripts,
            report.as_deref(),
            active.output.full_output(),
        );
        let status = determine_status(&parsed.scripts, exit_code);

        let record = RunRecord::new(
            run_id,
            active.timestamp,
            active.config.clone(),
            status,
            parsed.scripts,
        )
        .with_duration_ms(duration_ms)
        .with_exit_code(exit_code)
        .with_source(parsed.source)
        .with_report_path(report_path)
        .with_log_excerpt(active.output.excerpt());

        let totals = *record.totals();
        let approximate = record.scripts().iter().filter(|s| s.is_approximate()).count();
        let persist_error = self.persist(&record).await;

        let mut state = self.state.lock();
        self.events.emit(RunEvent::Ended {
            run_id,
            status,
            record: Box::new(record),
            persist_error,
        });
        state.slot = Slot::Idle;
        drop(state);

        info!(
            "Run {} {}: {}/{} passed ({}%)",
            run_id, status, totals.total_passed, totals.total_tests, totals.success_rate
        );
        if approximate > 0 {
            warn!(
                "Run {}: {} of {} scripts have no report evidence ({:?})",
                run_id,
                approximate,
                active.config.scripts.len(),
                parsed.source
            );
        }
    }

    /// The run's report text, archived under the data dir when there is one.
    async fn archive_report(
        &self,
        run_id: RunId,
        output: &mut OutputCapture,
    ) -> (Option<String>, Option<PathBuf>) {
        let report = match output.take_report() {
            Some(text) => Some(text),
            None => match self.config.suite.report_file_path() {
                Some(path) => match tokio::fs::read_to_string(&path).await {
                    Ok(text) => Some(text),
                    Err(e) => {
                        warn!("Run {}: report file {} unreadable: {}", run_id, path.display(), e);
                        None
                    }
                },
                None => None,
            },
        };

        let Some(text) = report else {
            return (None, None);
        };

        let path = self.config.report_path(run_id);
        match tokio::fs::write(&path, &text).await {
            Ok(()) => (Some(text), Some(path)),
            Err(e) => {
                warn!("Run {}: failed to archive report to {}: {}", run_id, path.display(), e);
                (Some(text), None)
            }
        }
    }

    /// Append to history, reporting a failure instead of propagating it.
    /// The write syncs to disk, so it runs on the blocking pool.
    async fn persist(&self, record: &RunRecord) -> Option<String> {
        let history = Arc::clone(&self.history);
        let owned = record.clone();
        let result = tokio::task::spawn_blocking(move || history.append(owned))
            .await
            .unwrap_or_else(|e| Err(Error::Internal(format!("history write task failed: {}", e))));
        match result {
            Ok(()) => None,
            Err(e) => {
                error!("Failed to persist run {}: {}", record.run_id, e);
                Some(e.to_string())
            }
        }
    }
}

/// Single consumer of runner events. Exits once the controller is dropped.
async fn dispatch(inner: Weak<Inner>, mut rx: mpsc::Receiver<RunnerEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_event(event).await;
    }
    debug!("Runner event dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_ids_strictly_increase() {
        let mut state = State {
            slot: Slot::Idle,
            last_run_id: Some(RunId(u64::MAX / 2)),
        };
        let first = state.next_run_id();
        let second = state.next_run_id();
        assert_eq!(first, RunId(u64::MAX / 2 + 1));
        assert!(second > first);
    }

    #[test]
    fn test_take_running_requires_matching_run() {
        let mut state = State {
            slot: Slot::Finalizing(RunId(3)),
            last_run_id: None,
        };
        assert!(state.take_running(None).is_none());
        assert!(state.take_running(Some(RunId(3))).is_none());
        assert!(matches!(state.slot, Slot::Finalizing(RunId(3))));
    }
}
