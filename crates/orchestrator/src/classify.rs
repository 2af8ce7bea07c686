//! Output line classification
//!
//! Every line the suite prints lands in the full output buffer. Only some of
//! it is worth showing to a person watching the run:
//!
//! - an embedded JSON report (a block opening with `{`) is captured on the side
//!   and never shown
//! - stdout chatter from the runner (worker banner, reporter hints, slow file
//!   warnings) is dropped
//! - stderr is shown only when it carries a failure marker

use once_cell::sync::Lazy;
use playdeck_common::Channel;
use regex::Regex;
use std::collections::VecDeque;

static ANSI_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("valid ansi regex"));

static WORKER_BANNER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Running \d+ tests? using \d+ workers?").expect("valid banner regex")
});

/// Known-noisy stdout phrases
const STDOUT_NOISE: &[&str] = &[
    "To open last HTML report run",
    "npx playwright show-report",
    "Slow test file",
    "Consider splitting slow test files",
    "Using reporters",
    "Listening on reporter",
];

/// stderr lines must carry one of these to be shown (compared lowercased)
const STDERR_FAILURE_MARKERS: &[&str] = &["error", "failed", "✘"];

/// How a single line is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    /// Forwarded to observers
    Shown,
    /// Known noise, kept only in the full buffer
    Noise,
    /// Part of an embedded machine-readable report
    Report,
}

pub fn strip_ansi(line: &str) -> String {
    ANSI_ESCAPE.replace_all(line, "").into_owned()
}

/// Per-stream classifier; tracks whether we are inside an embedded report.
#[derive(Debug)]
pub struct StreamClassifier {
    channel: Channel,
    depth: usize,
    current: String,
    completed: Option<String>,
}

impl StreamClassifier {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            depth: 0,
            current: String::new(),
            completed: None,
        }
    }

    pub fn classify(&mut self, line: &str) -> LineClass {
        if self.depth > 0 || line.trim_start().starts_with('{') {
            self.capture(line);
            return LineClass::Report;
        }

        match self.channel {
            Channel::Stdout => {
                let trimmed = line.trim();
                if WORKER_BANNER.is_match(trimmed)
                    || STDOUT_NOISE.iter().any(|phrase| trimmed.contains(phrase))
                {
                    LineClass::Noise
                } else {
                    LineClass::Shown
                }
            }
            Channel::Stderr => {
                let lower = line.to_lowercase();
                if STDERR_FAILURE_MARKERS.iter().any(|m| lower.contains(m)) {
                    LineClass::Shown
                } else {
                    LineClass::Noise
                }
            }
        }
    }

    fn capture(&mut self, line: &str) {
        self.current.push_str(line);
        self.current.push('\n');

        // A lone closing brace at the top level is the matching close.
        if self.depth == 1 && line.trim() == "}" {
            self.depth = 0;
            self.finish_block();
            return;
        }

        let (opened, closed) = brace_counts(line);
        self.depth = (self.depth + opened).saturating_sub(closed);
        if self.depth == 0 {
            self.finish_block();
        }
    }

    /// Keep the block as the report unless it is not JSON and a JSON block
    /// was already seen (console-logged objects also open with `{`).
    fn finish_block(&mut self) {
        let block = std::mem::take(&mut self.current);
        let is_json = serde_json::from_str::<serde::de::IgnoredAny>(&block).is_ok();
        if is_json || self.completed.is_none() {
            self.completed = Some(block);
        }
    }

    /// The last complete report block, or the unterminated one if the stream
    /// was cut off mid-report.
    pub fn take_report(&mut self) -> Option<String> {
        if let Some(done) = self.completed.take() {
            return Some(done);
        }
        if self.current.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.current))
        }
    }
}

/// Opening and closing braces on one line, skipping those inside strings.
///
/// JSON strings never span lines. A line that ends inside a string is not
/// JSON at all (e.g. a console-logged object with a stray quote), so its
/// braces are counted raw instead.
fn brace_counts(line: &str) -> (usize, usize) {
    let mut opened = 0;
    let mut closed = 0;
    let mut in_string = false;
    let mut escaped = false;
    for ch in line.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => opened += 1,
            '}' => closed += 1,
            _ => {}
        }
    }

    if in_string {
        (line.matches('{').count(), line.matches('}').count())
    } else {
        (opened, closed)
    }
}

/// Everything captured from one run's output.
#[derive(Debug)]
pub struct OutputCapture {
    stdout: StreamClassifier,
    stderr: StreamClassifier,
    full: String,
    excerpt: VecDeque<String>,
    excerpt_lines: usize,
}

impl OutputCapture {
    pub fn new(excerpt_lines: usize) -> Self {
        Self {
            stdout: StreamClassifier::new(Channel::Stdout),
            stderr: StreamClassifier::new(Channel::Stderr),
            full: String::new(),
            excerpt: VecDeque::new(),
            excerpt_lines,
        }
    }

    /// Record one raw line; returns the text to show, if any.
    pub fn push(&mut self, channel: Channel, raw: &str) -> Option<String> {
        let line = strip_ansi(raw);
        self.full.push_str(&line);
        self.full.push('\n');

        let class = match channel {
            Channel::Stdout => self.stdout.classify(&line),
            Channel::Stderr => self.stderr.classify(&line),
        };
        if class != LineClass::Shown {
            return None;
        }

        if self.excerpt_lines > 0 {
            if self.excerpt.len() == self.excerpt_lines {
                self.excerpt.pop_front();
            }
            self.excerpt.push_back(line.clone());
        }
        Some(line)
    }

    pub fn full_output(&self) -> &str {
        &self.full
    }

    /// Embedded report, preferring stdout
    pub fn take_report(&mut self) -> Option<String> {
        self.stdout
            .take_report()
            .or_else(|| self.stderr.take_report())
    }

    pub fn excerpt(&self) -> Vec<String> {
        self.excerpt.iter().cloned().collect()
    }
}
