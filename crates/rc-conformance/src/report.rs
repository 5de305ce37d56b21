use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use rc_types::{IgnoreCategory, Outcome, RunResult, TranscriptMarkers, hash_hex};
use serde::{Deserialize, Serialize};

use crate::HarnessError;

const SUMMARY_WIDTH: usize = 160;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    pub id: String,
    pub outcome: Outcome,
    pub expected: String,
    pub actual: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Aggregate view of one run. Built by folding over results; the results
/// themselves are kept unchanged, ordered by case id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub total: usize,
    pub counts: BTreeMap<Outcome, usize>,
    pub category_counts: BTreeMap<IgnoreCategory, usize>,
    pub diagnostics: Vec<DiagnosticEntry>,
    pub results: Vec<RunResult>,
}

impl RunReport {
    #[must_use]
    pub fn from_results(results: impl IntoIterator<Item = RunResult>) -> Self {
        let mut results: Vec<RunResult> = results.into_iter().collect();
        results.sort_by(|a, b| a.case.id.cmp(&b.case.id));

        let markers = TranscriptMarkers::default();
        let mut counts: BTreeMap<Outcome, usize> =
            Outcome::ALL.iter().map(|outcome| (*outcome, 0)).collect();
        let mut category_counts = BTreeMap::new();
        let mut diagnostics = Vec::new();

        for result in &results {
            *counts.entry(result.outcome).or_default() += 1;
            if result.case.disposition.is_ignored() {
                let category = result
                    .case
                    .disposition
                    .category
                    .unwrap_or(IgnoreCategory::Unknown);
                *category_counts.entry(category).or_default() += 1;
            }
            if result.outcome.needs_review() {
                diagnostics.push(DiagnosticEntry {
                    id: result.case.id.clone(),
                    outcome: result.outcome,
                    expected: result.expected_summary.clone(),
                    actual: result.actual.render_transcript(&markers),
                    reason: result.mismatch.clone(),
                });
            }
        }

        Self {
            total: results.len(),
            counts,
            category_counts,
            diagnostics,
            results,
        }
    }

    #[must_use]
    pub fn count(&self, outcome: Outcome) -> usize {
        self.counts.get(&outcome).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn is_green(&self, fail_on_unexpected_pass: bool) -> bool {
        exit_code(self, fail_on_unexpected_pass) == 0
    }
}

/// Non-zero iff any case failed unexpectedly, or passed unexpectedly when
/// `fail_on_unexpected_pass` is set.
#[must_use]
pub fn exit_code(report: &RunReport, fail_on_unexpected_pass: bool) -> u8 {
    let failing = report.count(Outcome::UnexpectedFail) > 0
        || (fail_on_unexpected_pass && report.count(Outcome::UnexpectedPass) > 0);
    u8::from(failing)
}

#[must_use]
pub fn render_summary(report: &RunReport, limit: usize) -> String {
    let mut out = format!("cases={}", report.total);
    for outcome in Outcome::ALL {
        let _ = write!(out, " {}={}", outcome, report.count(outcome));
    }
    out.push('\n');

    if !report.category_counts.is_empty() {
        out.push_str("ignored by category:");
        for (category, count) in &report.category_counts {
            let _ = write!(out, " {category}={count}");
        }
        out.push('\n');
    }

    for entry in report.diagnostics.iter().take(limit) {
        let _ = writeln!(out, "--- {} {} ---", entry.outcome, entry.id);
        if let Some(reason) = &entry.reason {
            let _ = writeln!(out, "reason: {reason}");
        }
        let _ = writeln!(out, "expected:\n{}", entry.expected.trim_end_matches('\n'));
        let _ = writeln!(out, "actual:\n{}", entry.actual.trim_end_matches('\n'));
    }
    if report.diagnostics.len() > limit {
        let _ = writeln!(
            out,
            "... {} more cases need review",
            report.diagnostics.len() - limit
        );
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: String,
    pub outcome: Outcome,
    pub category: Option<IgnoreCategory>,
    pub actual_summary: String,
}

impl ResultRecord {
    #[must_use]
    pub fn from_result(result: &RunResult) -> Self {
        Self {
            id: result.case.id.clone(),
            outcome: result.outcome,
            category: result.case.disposition.category,
            actual_summary: actual_summary(result),
        }
    }
}

/// One JSON record per result, in report order.
pub fn write_jsonl(report: &RunReport, path: &Path) -> Result<(), HarnessError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let mut body = String::new();
    for result in &report.results {
        body.push_str(&serde_json::to_string(&ResultRecord::from_result(result))?);
        body.push('\n');
    }
    fs::write(path, body)?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    pub ts: String,
    pub total: usize,
    pub pass: usize,
    pub expected_fail: usize,
    pub unexpected_fail: usize,
    pub unexpected_pass: usize,
    pub report_hash: String,
}

pub fn append_run_history(path: &Path, report: &RunReport) -> Result<RunHistoryEntry, HarnessError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let report_json = serde_json::to_vec(report)?;
    let entry = RunHistoryEntry {
        ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        total: report.total,
        pass: report.count(Outcome::Pass),
        expected_fail: report.count(Outcome::ExpectedFail),
        unexpected_fail: report.count(Outcome::UnexpectedFail),
        unexpected_pass: report.count(Outcome::UnexpectedPass),
        report_hash: format!("sha256:{}", hash_hex(&report_json)),
    };

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{}", serde_json::to_string(&entry)?)?;
    Ok(entry)
}

fn actual_summary(result: &RunResult) -> String {
    let transcript = result
        .actual
        .render_transcript(&TranscriptMarkers::default())
        .replace('\n', "\\n");
    if transcript.chars().count() <= SUMMARY_WIDTH {
        return transcript;
    }
    let mut clipped: String = transcript.chars().take(SUMMARY_WIDTH).collect();
    clipped.push_str("...");
    clipped
}

#[cfg(test)]
mod tests {
    use std::fs;

    use proptest::prelude::*;
    use rc_types::{
        CaseDescriptor, Disposition, IgnoreCategory, Outcome, Output, RunResult,
    };

    use super::{
        ResultRecord, RunReport, append_run_history, exit_code, render_summary, write_jsonl,
    };

    fn result(id: &str, outcome: Outcome, disposition: Disposition, actual: &str) -> RunResult {
        RunResult {
            case: CaseDescriptor::exact(id, "x", "42").with_disposition(disposition),
            actual: Output::text(actual),
            expected_summary: "42".to_owned(),
            outcome,
            fault: None,
            mismatch: (outcome == Outcome::UnexpectedFail).then(|| "line 1 differs".to_owned()),
            duration_ms: 1,
        }
    }

    fn sample() -> RunReport {
        RunReport::from_results(vec![
            result("d", Outcome::UnexpectedFail, Disposition::normal(), "43"),
            result("a", Outcome::Pass, Disposition::normal(), "42"),
            result(
                "c",
                Outcome::ExpectedFail,
                Disposition::ignored(IgnoreCategory::Unimplemented),
                "43",
            ),
            result(
                "b",
                Outcome::UnexpectedPass,
                Disposition::ignored(IgnoreCategory::Unknown),
                "42",
            ),
        ])
    }

    #[test]
    fn report_folds_counts_and_orders_by_id() {
        let report = sample();
        assert_eq!(report.total, 4);
        for outcome in Outcome::ALL {
            assert_eq!(report.count(outcome), 1, "{outcome}");
        }
        assert_eq!(report.category_counts.get(&IgnoreCategory::Unimplemented), Some(&1));
        assert_eq!(report.category_counts.get(&IgnoreCategory::Unknown), Some(&1));
        let ids: Vec<_> = report.results.iter().map(|r| r.case.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
        let flagged: Vec<_> = report.diagnostics.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(flagged, vec!["b", "d"]);
    }

    #[test]
    fn exit_code_tracks_unexpected_outcomes() {
        let report = sample();
        assert_eq!(exit_code(&report, false), 1);
        let only_unexpected_pass = RunReport::from_results(vec![result(
            "b",
            Outcome::UnexpectedPass,
            Disposition::ignored(IgnoreCategory::Unknown),
            "42",
        )]);
        assert_eq!(exit_code(&only_unexpected_pass, false), 0);
        assert_eq!(exit_code(&only_unexpected_pass, true), 1);
        assert!(RunReport::from_results(Vec::new()).is_green(true));
    }

    #[test]
    fn summary_shows_counts_and_limited_diffs() {
        let summary = render_summary(&sample(), 1);
        assert!(summary.starts_with(
            "cases=4 pass=1 expected_fail=1 unexpected_fail=1 unexpected_pass=1\n"
        ));
        assert!(summary.contains("ignored by category: unknown=1 unimplemented=1"));
        assert!(summary.contains("--- unexpected_pass b ---"));
        assert!(!summary.contains("--- unexpected_fail d ---"));
        assert!(summary.contains("... 1 more cases need review"));
    }

    #[test]
    fn jsonl_has_one_record_per_result() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("reports/run.jsonl");
        write_jsonl(&sample(), &path).expect("write");
        let body = fs::read_to_string(&path).expect("read");
        let records: Vec<ResultRecord> = body
            .lines()
            .map(|line| serde_json::from_str(line).expect("record"))
            .collect();
        assert_eq!(records.len(), 4);
        assert_eq!(records[2].id, "c");
        assert_eq!(records[2].category, Some(IgnoreCategory::Unimplemented));
        assert_eq!(records[3].actual_summary, "43");
        assert!(body.lines().next().expect("first").contains("\"outcome\":\"pass\""));
    }

    #[test]
    fn history_appends_hashed_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("history.jsonl");
        let first = append_run_history(&path, &sample()).expect("first");
        let second = append_run_history(&path, &sample()).expect("second");
        assert_eq!(first.report_hash, second.report_hash);
        assert!(first.report_hash.starts_with("sha256:"));
        assert_eq!(first.unexpected_fail, 1);
        let body = fs::read_to_string(&path).expect("read");
        assert_eq!(body.lines().count(), 2);
    }

    proptest! {
        #[test]
        fn counts_partition_the_results(picks in prop::collection::vec(0usize..4, 0..40)) {
            let results = picks.iter().enumerate().map(|(idx, pick)| {
                let outcome = Outcome::ALL[*pick];
                let disposition = match outcome {
                    Outcome::Pass | Outcome::UnexpectedFail => Disposition::normal(),
                    Outcome::ExpectedFail | Outcome::UnexpectedPass => {
                        Disposition::ignored(IgnoreCategory::Unknown)
                    }
                };
                result(&format!("case-{idx:03}"), outcome, disposition, "42")
            });
            let report = RunReport::from_results(results);
            let summed: usize = Outcome::ALL.iter().map(|outcome| report.count(*outcome)).sum();
            prop_assert_eq!(summed, picks.len());
            let ignored: usize = report.category_counts.values().sum();
            prop_assert_eq!(
                ignored,
                report.count(Outcome::ExpectedFail) + report.count(Outcome::UnexpectedPass)
            );
            prop_assert_eq!(
                exit_code(&report, false) == 1,
                report.count(Outcome::UnexpectedFail) > 0
            );
        }
    }
}
