//! Result parsing
//!
//! Preferred source is Playwright's JSON report. When that is missing or
//! unreadable, figures are scraped from the console output instead, and every
//! script is tagged with the [`Evidence`] its numbers came from.

use once_cell::sync::Lazy;
use playdeck_common::{
    Error, Evidence, Result, ResultSource, RunStatus, ScriptResult, TestCaseResult, TestOutcome,
};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

/// Lines after a script mention searched for summary counts
const SUMMARY_WINDOW: usize = 5;

static TEST_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:(?P<pass>✓|✔|ok)|(?P<fail>✘|✗|×|x))\s+\d+\s")
        .expect("valid test line regex")
});

static LINE_DURATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\((?P<value>\d+(?:\.\d+)?)(?P<unit>ms|s|m)\)\s*$").expect("valid duration regex")
});

static PASSED_COUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?P<n>\d+)\s+passed").expect("valid passed regex"));

static FAILED_COUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?P<n>\d+)\s+failed").expect("valid failed regex"));

static SUMMARY_SECONDS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\((?P<secs>\d+(?:\.\d+)?)s\)").expect("valid seconds regex"));

/// Per-script results plus where they came from
#[derive(Debug, Clone)]
pub struct ParsedResults {
    pub scripts: Vec<ScriptResult>,
    pub source: ResultSource,
}

// Playwright JSON reporter shapes; only the fields we read.

#[derive(Debug, Deserialize)]
struct Report {
    #[serde(default)]
    suites: Vec<ReportSuite>,
}

#[derive(Debug, Deserialize)]
struct ReportSuite {
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    specs: Vec<ReportSpec>,
    #[serde(default)]
    suites: Vec<ReportSuite>,
}

#[derive(Debug, Deserialize)]
struct ReportSpec {
    #[serde(default)]
    title: String,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    tests: Vec<ReportTest>,
}

#[derive(Debug, Deserialize)]
struct ReportTest {
    #[serde(default)]
    status: Option<String>,
    #[serde(default, rename = "projectName")]
    project_name: Option<String>,
    #[serde(default)]
    results: Vec<ReportTestRun>,
}

#[derive(Debug, Deserialize)]
struct ReportTestRun {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    duration: f64,
}

/// Parse a run's results, preferring the structured report.
///
/// Always returns exactly one entry per script, in request order.
pub fn parse_results(scripts: &[String], report: Option<&str>, console: &str) -> ParsedResults {
    match report.map(|json| parse_report(json, scripts)) {
        Some(Ok(from_report)) => {
            let scripts = from_report
                .into_iter()
                .map(|result| {
                    if result.total_tests > 0 {
                        return result;
                    }
                    // Nothing in the report for this script; the console may
                    // still know about it.
                    let console_result = parse_console_script(console, &result.script);
                    if console_result.evidence == Evidence::Console {
                        console_result
                    } else {
                        result
                    }
                })
                .collect();
            ParsedResults {
                scripts,
                source: ResultSource::Report,
            }
        }
        Some(Err(e)) => {
            warn!("Structured report unusable, falling back to console output: {}", e);
            console_results(scripts, console)
        }
        None => {
            debug!("No structured report, parsing console output");
            console_results(scripts, console)
        }
    }
}

fn console_results(scripts: &[String], console: &str) -> ParsedResults {
    let scripts = parse_console(console, scripts);
    let source = if scripts.iter().any(|s| s.evidence == Evidence::Console) {
        ResultSource::Console
    } else {
        ResultSource::None
    };
    ParsedResults { scripts, source }
}

/// Structured report parsing. Fails only if the JSON itself is unreadable.
pub fn parse_report(json: &str, scripts: &[String]) -> Result<Vec<ScriptResult>> {
    let report: Report =
        serde_json::from_str(json).map_err(|e| Error::Report(format!("invalid JSON report: {}", e)))?;

    Ok(scripts
        .iter()
        .map(|script| {
            let mut tests = Vec::new();
            let mut duration_ms = 0.0;
            for suite in &report.suites {
                collect_suite(suite, script, false, &mut tests, &mut duration_ms);
            }
            script_result(script, tests, duration_ms.round() as u64, Evidence::Report)
        })
        .collect())
}

fn collect_suite(
    suite: &ReportSuite,
    script: &str,
    parent_matched: bool,
    tests: &mut Vec<TestCaseResult>,
    duration_ms: &mut f64,
) {
    let matched = parent_matched || file_matches(suite.file.as_deref(), script);

    for spec in &suite.specs {
        if !matched && !file_matches(spec.file.as_deref(), script) {
            continue;
        }
        for test in &spec.tests {
            let last = test.results.last();
            let duration = last.map(|r| r.duration).unwrap_or(0.0).max(0.0);
            *duration_ms += duration;

            let title = match test.project_name.as_deref() {
                Some(project) if !project.is_empty() => format!("{} [{}]", spec.title, project),
                _ => spec.title.clone(),
            };
            tests.push(TestCaseResult {
                title,
                outcome: classify_outcome(
                    test.status.as_deref(),
                    last.and_then(|r| r.status.as_deref()),
                ),
                duration_ms: duration.round() as u64,
            });
        }
    }

    for child in &suite.suites {
        collect_suite(child, script, matched, tests, duration_ms);
    }
}

fn file_matches(file: Option<&str>, script: &str) -> bool {
    file.map_or(false, |f| f.contains(script))
}

/// Map Playwright's test status and last result status to an outcome.
///
/// `unexpected` always fails; `expected` covers tests marked to fail that did.
fn classify_outcome(test_status: Option<&str>, result_status: Option<&str>) -> TestOutcome {
    if test_status == Some("unexpected") {
        return TestOutcome::Failed;
    }
    if result_status == Some("passed") || matches!(test_status, Some("expected") | Some("flaky")) {
        return TestOutcome::Passed;
    }
    match (result_status, test_status) {
        (Some("failed") | Some("timedOut"), _) => TestOutcome::Failed,
        (Some("skipped"), _) | (_, Some("skipped")) => TestOutcome::Skipped,
        _ => TestOutcome::Other,
    }
}

fn script_result(
    script: &str,
    tests: Vec<TestCaseResult>,
    duration_ms: u64,
    evidence: Evidence,
) -> ScriptResult {
    let passed = tests
        .iter()
        .filter(|t| t.outcome == TestOutcome::Passed)
        .count() as u32;
    let failed = tests
        .iter()
        .filter(|t| t.outcome == TestOutcome::Failed)
        .count() as u32;
    ScriptResult {
        script: script.to_string(),
        passed,
        failed,
        total_tests: tests.len() as u32,
        duration_ms,
        tests,
        evidence,
    }
}

/// Console fallback for every script. Never fails.
pub fn parse_console(console: &str, scripts: &[String]) -> Vec<ScriptResult> {
    scripts
        .iter()
        .map(|script| parse_console_script(console, script))
        .collect()
}

fn parse_console_script(console: &str, script: &str) -> ScriptResult {
    let lines: Vec<&str> = console.lines().collect();

    // Per-test list reporter lines are the most precise evidence.
    let mut tests = Vec::new();
    for line in lines.iter().filter(|l| l.contains(script)) {
        let Some(caps) = TEST_LINE.captures(line) else {
            continue;
        };
        let outcome = if caps.name("pass").is_some() {
            TestOutcome::Passed
        } else {
            TestOutcome::Failed
        };
        let title = line
            .rsplit('›')
            .next()
            .map(|t| LINE_DURATION.replace(t, "").trim().to_string())
            .unwrap_or_default();
        tests.push(TestCaseResult {
            title,
            outcome,
            duration_ms: line_duration_ms(line).unwrap_or(0),
        });
    }
    if !tests.is_empty() {
        let duration_ms = tests.iter().map(|t| t.duration_ms).sum();
        return script_result(script, tests, duration_ms, Evidence::Console);
    }

    // Otherwise look for "N passed / N failed (Xs)" near a mention.
    for (idx, _) in lines.iter().enumerate().filter(|(_, l)| l.contains(script)) {
        let end = (idx + SUMMARY_WINDOW + 1).min(lines.len());
        let window = &lines[idx..end];

        let passed = first_count(&PASSED_COUNT, window);
        let failed = first_count(&FAILED_COUNT, window);
        if passed.is_none() && failed.is_none() {
            continue;
        }

        let passed = passed.unwrap_or(0);
        let failed = failed.unwrap_or(0);
        let duration_ms = window
            .iter()
            .find_map(|l| SUMMARY_SECONDS.captures(l))
            .and_then(|c| c["secs"].parse::<f64>().ok())
            .map(|secs| (secs * 1000.0).round() as u64)
            .unwrap_or(0);

        return ScriptResult {
            script: script.to_string(),
            passed,
            failed,
            total_tests: passed + failed,
            duration_ms,
            tests: Vec::new(),
            evidence: Evidence::Console,
        };
    }

    ScriptResult::missing(script)
}

fn first_count(re: &Regex, window: &[&str]) -> Option<u32> {
    window
        .iter()
        .find_map(|l| re.captures(l))
        .and_then(|c| c["n"].parse::<u32>().ok())
}

fn line_duration_ms(line: &str) -> Option<u64> {
    let caps = LINE_DURATION.captures(line)?;
    let value: f64 = caps["value"].parse().ok()?;
    let ms = match &caps["unit"] {
        "ms" => value,
        "s" => value * 1000.0,
        "m" => value * 60_000.0,
        _ => return None,
    };
    Some(ms.round() as u64)
}

/// Terminal status for a run that finished on its own.
pub fn determine_status(scripts: &[ScriptResult], exit_code: Option<i32>) -> RunStatus {
    if scripts.iter().any(|s| s.failed > 0) {
        return RunStatus::Failed;
    }
    match exit_code {
        Some(0) => RunStatus::Passed,
        _ => RunStatus::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use playdeck_common::RunTotals;
    use serde_json::json;

    fn scripts(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn passing(title: &str, duration: f64) -> serde_json::Value {
        json!({
            "title": title,
            "tests": [{
                "status": "expected",
                "projectName": "chromium",
                "results": [{ "status": "passed", "duration": duration }]
            }]
        })
    }

    fn failing(title: &str, duration: f64) -> serde_json::Value {
        json!({
            "title": title,
            "tests": [{
                "status": "unexpected",
                "projectName": "chromium",
                "results": [
                    { "status": "failed", "duration": 100.0 },
                    { "status": "failed", "duration": duration }
                ]
            }]
        })
    }

    fn sample_report() -> String {
        json!({
            "config": {},
            "suites": [
                {
                    "title": "login.spec.ts",
                    "file": "login.spec.ts",
                    "specs": [passing("logs in", 1000.4), passing("logs out", 500.3)],
                    "suites": [{
                        "title": "remember me",
                        "file": "login.spec.ts",
                        "specs": [passing("keeps session", 250.0)],
                        "suites": []
                    }]
                },
                {
                    "title": "header.spec.ts",
                    "file": "header.spec.ts",
                    "specs": [passing("shows logo", 300.0), failing("menu opens", 700.0)],
                    "suites": []
                }
            ]
        })
        .to_string()
    }

    #[test]
    fn test_report_scenario_totals() {
        let requested = scripts(&["login", "header"]);
        let parsed = parse_results(&requested, Some(sample_report().as_str()), "");
        assert_eq!(parsed.source, ResultSource::Report);

        let login = &parsed.scripts[0];
        assert_eq!(login.script, "login");
        assert_eq!((login.passed, login.failed, login.total_tests), (3, 0, 3));
        assert_eq!(login.duration_ms, 1751);
        assert_eq!(login.tests[0].title, "logs in [chromium]");

        let header = &parsed.scripts[1];
        assert_eq!((header.passed, header.failed, header.total_tests), (1, 1, 2));
        // Only the last attempt counts.
        assert_eq!(header.duration_ms, 1000);

        let totals = RunTotals::from_results(&parsed.scripts);
        assert_eq!(totals.total_tests, 5);
        assert_eq!(totals.total_passed, 4);
        assert_eq!(totals.total_failed, 1);
        assert_eq!(totals.success_rate, 80);
        assert_eq!(determine_status(&parsed.scripts, Some(1)), RunStatus::Failed);
    }

    #[test]
    fn test_outcome_classification() {
        assert_eq!(classify_outcome(Some("expected"), Some("passed")), TestOutcome::Passed);
        // test.fail() that did fail
        assert_eq!(classify_outcome(Some("expected"), Some("failed")), TestOutcome::Passed);
        // test.fail() that passed
        assert_eq!(classify_outcome(Some("unexpected"), Some("passed")), TestOutcome::Failed);
        assert_eq!(classify_outcome(Some("flaky"), Some("passed")), TestOutcome::Passed);
        assert_eq!(classify_outcome(None, Some("timedOut")), TestOutcome::Failed);
        assert_eq!(classify_outcome(Some("skipped"), Some("skipped")), TestOutcome::Skipped);
        assert_eq!(classify_outcome(None, Some("interrupted")), TestOutcome::Other);
    }

    #[test]
    fn test_other_outcomes_count_toward_total_only() {
        let report = json!({
            "suites": [{
                "file": "betslip.spec.ts",
                "specs": [
                    passing("adds selection", 10.0),
                    { "title": "skipped one", "tests": [{ "status": "skipped", "results": [] }] }
                ]
            }]
        })
        .to_string();
        let parsed = parse_report(&report, &scripts(&["betslip"])).unwrap();
        assert_eq!(parsed[0].total_tests, 2);
        assert_eq!(parsed[0].passed, 1);
        assert_eq!(parsed[0].failed, 0);
    }

    #[test]
    fn test_invalid_report_falls_back_to_console() {
        let console = "  ✓  1 [chromium] › login.spec.ts:3:5 › logs in (1.5s)\n";
        let parsed = parse_results(&scripts(&["login"]), Some("{ not json"), console);
        assert_eq!(parsed.source, ResultSource::Console);
        assert_eq!(parsed.scripts[0].evidence, Evidence::Console);
        assert_eq!(parsed.scripts[0].passed, 1);
        assert_eq!(parsed.scripts[0].duration_ms, 1500);
        assert_eq!(parsed.scripts[0].tests[0].title, "logs in");
    }

    #[test]
    fn test_console_per_test_lines() {
        let console = "\
Running 3 tests using 1 worker
  ✓  1 [chromium] › header.spec.ts:3:5 › shows logo (812ms)
  ✘  2 [chromium] › header.spec.ts:9:5 › menu opens (3.4s)
  ✓  3 [chromium] › login.spec.ts:3:5 › logs in (1.0s)
";
        let results = parse_console(console, &scripts(&["header", "login"]));
        assert_eq!((results[0].passed, results[0].failed), (1, 1));
        assert_eq!(results[0].duration_ms, 4212);
        assert_eq!((results[1].passed, results[1].failed), (1, 0));
    }

    #[test]
    fn test_console_summary_near_mention() {
        let console = "\
[suite] running header
  4 passed
  1 failed (12.5s)
";
        let results = parse_console(console, &scripts(&["header"]));
        assert_eq!(results[0].evidence, Evidence::Console);
        assert_eq!((results[0].passed, results[0].failed, results[0].total_tests), (4, 1, 5));
        assert_eq!(results[0].duration_ms, 12_500);
    }

    #[test]
    fn test_missing_evidence_is_tagged_not_invented() {
        let parsed = parse_results(&scripts(&["betslip"]), None, "nothing useful here\n");
        assert_eq!(parsed.source, ResultSource::None);
        assert_eq!(parsed.scripts.len(), 1);

        let betslip = &parsed.scripts[0];
        assert_eq!(betslip.script, "betslip");
        assert_eq!(betslip.total_tests, 0);
        assert_eq!(betslip.evidence, Evidence::Missing);
        assert!(betslip.is_approximate());

        let totals = RunTotals::from_results(&parsed.scripts);
        assert_eq!(totals.success_rate, 0);
    }

    #[test]
    fn test_report_without_script_uses_console() {
        let report = json!({ "suites": [] }).to_string();
        let console = "  ✓  1 [chromium] › login.spec.ts:3:5 › logs in (1.0s)\n";
        let parsed = parse_results(&scripts(&["login", "betslip"]), Some(report.as_str()), console);
        assert_eq!(parsed.source, ResultSource::Report);
        assert_eq!(parsed.scripts[0].evidence, Evidence::Console);
        assert_eq!(parsed.scripts[1].evidence, Evidence::Report);
        assert_eq!(parsed.scripts[1].total_tests, 0);
    }

    #[test]
    fn test_status_rules() {
        let clean = vec![ScriptResult::missing("login")];
        assert_eq!(determine_status(&clean, Some(0)), RunStatus::Passed);
        assert_eq!(determine_status(&clean, Some(1)), RunStatus::Failed);
        assert_eq!(determine_status(&clean, None), RunStatus::Failed);
    }
}
