//! Orchestrator configuration

use playdeck_common::{Region, RunId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Directory holding the history log and archived reports
    pub data_dir: PathBuf,

    /// Buffered events per observer before it starts lagging
    pub event_capacity: usize,

    /// Bound on the runner → dispatcher channel
    pub line_channel_capacity: usize,

    /// How long to wait for the second half of a termination (exit code or
    /// stream drain) before finalizing with what is known
    pub termination_grace_ms: u64,

    /// Shown log lines kept on each run record
    pub log_excerpt_lines: usize,

    /// How to invoke the test suite
    pub suite: SuiteConfig,

    /// Per-region settings, keyed by region code (e.g. "ZA")
    pub regions: BTreeMap<String, RegionConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            data_dir: playdeck_common::default_data_dir(),
            event_capacity: 1024,
            line_channel_capacity: 512,
            termination_grace_ms: 2000,
            log_excerpt_lines: 200,
            suite: SuiteConfig::default(),
            regions: BTreeMap::new(),
        }
    }
}

/// Test suite invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SuiteConfig {
    /// Executable to spawn
    pub command: String,

    /// Arguments placed before the reporter arg and the script filters
    pub args: Vec<String>,

    /// Reporter selection; the JSON reporter must print to stdout unless
    /// `report_file` is set
    pub reporter_arg: Option<String>,

    /// Working directory of the suite (the Playwright project root)
    pub working_dir: PathBuf,

    /// Where spec files live, relative to `working_dir` unless absolute
    pub specs_dir: PathBuf,

    /// File suffix identifying a spec file
    pub spec_suffix: String,

    /// Report file the suite writes itself, if it does not print the report
    pub report_file: Option<PathBuf>,

    /// Extra environment for every run
    pub env: BTreeMap<String, String>,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            command: "npx".to_string(),
            args: vec!["playwright".to_string(), "test".to_string()],
            reporter_arg: Some("--reporter=list,json".to_string()),
            working_dir: PathBuf::from("."),
            specs_dir: PathBuf::from("tests"),
            spec_suffix: ".spec.ts".to_string(),
            report_file: None,
            env: BTreeMap::new(),
        }
    }
}

impl SuiteConfig {
    /// Resolve a suite-relative path against the working directory
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_dir.join(path)
        }
    }

    pub fn specs_path(&self) -> PathBuf {
        self.resolve(&self.specs_dir)
    }

    pub fn report_file_path(&self) -> Option<PathBuf> {
        self.report_file.as_deref().map(|p| self.resolve(p))
    }
}

/// Region-specific settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegionConfig {
    /// Exported to the suite as BASE_URL
    pub base_url: Option<String>,
}

impl OrchestratorConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the history log path
    pub fn history_path(&self) -> PathBuf {
        self.data_dir.join("history.json")
    }

    /// Get the report archive directory
    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir.join("reports")
    }

    /// Archived report for one run
    pub fn report_path(&self, run_id: RunId) -> PathBuf {
        self.reports_dir().join(format!("{}.json", run_id))
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub fn base_url(&self, region: Region) -> Option<&str> {
        self.regions
            .get(region.code())
            .and_then(|r| r.base_url.as_deref())
    }
}
