//! Playdeck Orchestrator
//!
//! Runs a Playwright suite on request, one run at a time:
//! - Spawns the suite in its own process group and streams its output
//! - Classifies each line, forwarding only what a person wants to see
//! - Parses results from the JSON report, falling back to console output
//! - Keeps a bounded, atomically persisted history of finished runs
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  RunController                                              │
//! │    ├── start(config) -> RunId                               │
//! │    ├── stop() -> RunId                                      │
//! │    ├── rerun(run_id) -> RunId                               │
//! │    └── status() / history() / subscribe()                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ProcessRunner ──RunnerEvent──▶ dispatcher                  │
//! │    ├── Line { channel, text }     ├── OutputCapture         │
//! │    └── Terminated { exit_code }   ├── parse_results         │
//! │                                   ├── HistoryStore          │
//! │                                   └── EventBroadcaster      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod classify;
pub mod config;
pub mod controller;
pub mod events;
pub mod history;
pub mod parser;
pub mod process;

pub use config::{OrchestratorConfig, RegionConfig, SuiteConfig};
pub use controller::RunController;
pub use events::EventBroadcaster;
pub use history::{HistoryStore, HISTORY_CAPACITY};
pub use parser::{determine_status, parse_results, ParsedResults};
pub use process::{ProcessRunner, RunnerEvent, SuiteProcess, Termination};
