//! Core types for Playdeck runs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use crate::{Error, Result};

/// Run identifier, derived from the creation instant (ms since the Unix epoch).
///
/// Ordering of ids is creation order; the orchestrator guarantees uniqueness
/// by bumping colliding values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u64>()
            .map(RunId)
            .map_err(|_| Error::run_not_found(s))
    }
}

/// Deployment region a suite is run against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Region {
    Za,
    Ng,
    Gh,
    Ke,
    Tz,
    Ug,
    Zm,
    Mw,
    Mz,
}

impl Region {
    pub const ALL: [Region; 9] = [
        Region::Za,
        Region::Ng,
        Region::Gh,
        Region::Ke,
        Region::Tz,
        Region::Ug,
        Region::Zm,
        Region::Mw,
        Region::Mz,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            Region::Za => "ZA",
            Region::Ng => "NG",
            Region::Gh => "GH",
            Region::Ke => "KE",
            Region::Tz => "TZ",
            Region::Ug => "UG",
            Region::Zm => "ZM",
            Region::Mw => "MW",
            Region::Mz => "MZ",
        }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Region {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let code = s.trim();
        if code.is_empty() {
            return Err(Error::InvalidConfig("region must not be empty".to_string()));
        }
        Region::ALL
            .iter()
            .copied()
            .find(|r| r.code().eq_ignore_ascii_case(code))
            .ok_or_else(|| Error::InvalidConfig(format!("unsupported region: {}", code)))
    }
}

/// What to run: captured verbatim for replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    pub region: Region,
    pub scripts: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl RunConfig {
    /// Build a validated config. Script order is kept; repeats are dropped.
    pub fn new<I, S>(region: &str, scripts: I, env: BTreeMap<String, String>) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let region = region.parse::<Region>()?;

        let mut ordered: Vec<String> = Vec::new();
        for script in scripts {
            let script = script.into().trim().to_string();
            if !ordered.contains(&script) {
                ordered.push(script);
            }
        }

        let config = Self {
            region,
            scripts: ordered,
            env,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scripts.is_empty() {
            return Err(Error::InvalidConfig("at least one script is required".to_string()));
        }
        for script in &self.scripts {
            if script.is_empty() {
                return Err(Error::InvalidConfig("script id must not be empty".to_string()));
            }
            // Script ids land in argv; never let one read as a flag.
            if script.starts_with('-') || script.chars().any(char::is_whitespace) {
                return Err(Error::InvalidConfig(format!("invalid script id: {:?}", script)));
            }
        }
        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(Error::InvalidConfig(format!("invalid env key: {:?}", key)));
            }
        }
        Ok(())
    }
}

/// Start request as received from a caller, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub scripts: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl RunRequest {
    pub fn into_config(self) -> Result<RunConfig> {
        RunConfig::new(&self.region, self.scripts, self.env)
    }
}

/// Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Passed,
    Failed,
    Stopped,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Passed => write!(f, "passed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Outcome of a single test case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Passed,
    Failed,
    Skipped,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub title: String,
    pub outcome: TestOutcome,
    pub duration_ms: u64,
}

/// Where a script's figures came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Evidence {
    /// Structured JSON report
    Report,
    /// Pattern matches in the console output
    Console,
    /// Nothing found; counts are zero placeholders
    Missing,
}

/// Per-script results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptResult {
    pub script: String,
    pub passed: u32,
    pub failed: u32,
    pub total_tests: u32,
    pub duration_ms: u64,
    #[serde(default)]
    pub tests: Vec<TestCaseResult>,
    pub evidence: Evidence,
}

impl ScriptResult {
    /// Placeholder for a script with no evidence at all.
    pub fn missing(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            passed: 0,
            failed: 0,
            total_tests: 0,
            duration_ms: 0,
            tests: Vec::new(),
            evidence: Evidence::Missing,
        }
    }

    pub fn is_approximate(&self) -> bool {
        self.evidence != Evidence::Report
    }
}

/// Totals across all scripts of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTotals {
    pub total_tests: u32,
    pub total_passed: u32,
    pub total_failed: u32,
    pub success_rate: u32,
}

impl RunTotals {
    pub fn from_results(results: &[ScriptResult]) -> Self {
        let total_tests: u32 = results.iter().map(|r| r.total_tests).sum();
        let total_passed: u32 = results.iter().map(|r| r.passed).sum();
        let total_failed: u32 = results.iter().map(|r| r.failed).sum();
        Self {
            total_tests,
            total_passed,
            total_failed,
            success_rate: success_rate(total_passed, total_tests),
        }
    }
}

/// `round(100 * passed / total)`, 0 for an empty run.
pub fn success_rate(passed: u32, total: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    (100.0 * passed as f64 / total as f64).round() as u32
}

/// Which parser produced the per-script results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Report,
    Console,
    None,
}

/// A finished run, as persisted in the history log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub config: RunConfig,
    pub status: RunStatus,
    scripts: Vec<ScriptResult>,
    totals: RunTotals,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub source: ResultSource,
    #[serde(default)]
    pub report_path: Option<PathBuf>,
    #[serde(default)]
    pub log_excerpt: Vec<String>,
}

impl RunRecord {
    /// Build a record; totals are always derived from `scripts`.
    pub fn new(
        run_id: RunId,
        timestamp: DateTime<Utc>,
        config: RunConfig,
        status: RunStatus,
        scripts: Vec<ScriptResult>,
    ) -> Self {
        let totals = RunTotals::from_results(&scripts);
        Self {
            run_id,
            timestamp,
            duration_ms: 0,
            config,
            status,
            scripts,
            totals,
            exit_code: None,
            source: ResultSource::None,
            report_path: None,
            log_excerpt: Vec::new(),
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn with_source(mut self, source: ResultSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_report_path(mut self, path: Option<PathBuf>) -> Self {
        self.report_path = path;
        self
    }

    pub fn with_log_excerpt(mut self, lines: Vec<String>) -> Self {
        self.log_excerpt = lines;
        self
    }

    pub fn scripts(&self) -> &[ScriptResult] {
        &self.scripts
    }

    pub fn totals(&self) -> &RunTotals {
        &self.totals
    }
}

/// Output stream of the suite process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Stdout,
    Stderr,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Stdout => write!(f, "stdout"),
            Channel::Stderr => write!(f, "stderr"),
        }
    }
}

/// Lifecycle and log events fanned out to observers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Started {
        run_id: RunId,
        config: RunConfig,
    },
    Log {
        run_id: RunId,
        channel: Channel,
        text: String,
    },
    Ended {
        run_id: RunId,
        status: RunStatus,
        record: Box<RunRecord>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        persist_error: Option<String>,
    },
    Stopped {
        run_id: RunId,
        reason: String,
        record: Box<RunRecord>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        persist_error: Option<String>,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> RunId {
        match self {
            RunEvent::Started { run_id, .. }
            | RunEvent::Log { run_id, .. }
            | RunEvent::Ended { run_id, .. }
            | RunEvent::Stopped { run_id, .. } => *run_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunEvent::Ended { .. } | RunEvent::Stopped { .. })
    }
}

/// Snapshot of the controller's run slot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ControllerStatus {
    Idle,
    Running {
        run_id: RunId,
        config: RunConfig,
        started_at: DateTime<Utc>,
        elapsed_ms: u64,
    },
    Finalizing {
        run_id: RunId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(script: &str, passed: u32, failed: u32, total: u32) -> ScriptResult {
        ScriptResult {
            script: script.to_string(),
            passed,
            failed,
            total_tests: total,
            duration_ms: 0,
            tests: vec![],
            evidence: Evidence::Report,
        }
    }

    #[test]
    fn test_region_parse() {
        assert_eq!("ZA".parse::<Region>().unwrap(), Region::Za);
        assert_eq!(" ke ".parse::<Region>().unwrap(), Region::Ke);
        assert!(matches!("".parse::<Region>(), Err(Error::InvalidConfig(_))));
        assert!(matches!("XX".parse::<Region>(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_region_serde_uses_code() {
        let json = serde_json::to_string(&Region::Za).unwrap();
        assert_eq!(json, "\"ZA\"");
        let back: Region = serde_json::from_str("\"NG\"").unwrap();
        assert_eq!(back, Region::Ng);
    }

    #[test]
    fn test_run_config_dedups_in_order() {
        let config = RunConfig::new("ZA", ["login", "header", "login"], BTreeMap::new()).unwrap();
        assert_eq!(config.scripts, vec!["login", "header"]);
    }

    #[test]
    fn test_run_config_rejects_bad_input() {
        let empty: [&str; 0] = [];
        assert!(RunConfig::new("ZA", empty, BTreeMap::new()).is_err());
        assert!(RunConfig::new("", ["login"], BTreeMap::new()).is_err());
        assert!(RunConfig::new("ZA", ["--grep"], BTreeMap::new()).is_err());
        assert!(RunConfig::new("ZA", ["two words"], BTreeMap::new()).is_err());

        let mut env = BTreeMap::new();
        env.insert("A=B".to_string(), "x".to_string());
        assert!(RunConfig::new("ZA", ["login"], env).is_err());
    }

    #[test]
    fn test_totals_are_derived() {
        let scripts = vec![result("login", 3, 0, 3), result("header", 1, 1, 2)];
        let record = RunRecord::new(
            RunId(1),
            Utc::now(),
            RunConfig::new("ZA", ["login", "header"], BTreeMap::new()).unwrap(),
            RunStatus::Failed,
            scripts,
        );
        let totals = record.totals();
        assert_eq!(totals.total_tests, 5);
        assert_eq!(totals.total_passed, 4);
        assert_eq!(totals.total_failed, 1);
        assert_eq!(totals.success_rate, 80);
        assert_eq!(
            totals.total_tests,
            record.scripts().iter().map(|s| s.total_tests).sum::<u32>()
        );
    }

    #[test]
    fn test_success_rate_edges() {
        assert_eq!(success_rate(0, 0), 0);
        assert_eq!(success_rate(2, 3), 67);
        assert_eq!(success_rate(1, 3), 33);
        assert_eq!(success_rate(5, 5), 100);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = RunEvent::Log {
            run_id: RunId(7),
            channel: Channel::Stderr,
            text: "Error: boom".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "log");
        assert_eq!(value["run_id"], 7);
        assert_eq!(value["channel"], "stderr");
    }

    #[test]
    fn test_run_id_parse() {
        assert_eq!("1700000000000".parse::<RunId>().unwrap(), RunId(1_700_000_000_000));
        assert!(matches!(
            "latest-ish".parse::<RunId>(),
            Err(Error::RunNotFound { .. })
        ));
    }
}
