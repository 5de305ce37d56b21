#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rc_io::{ExpectedEntry, ExpectedOutputFile, IoError, case_traits, write_diff, write_if_changed};
use rc_match::trim_trailing_spaces;
use rc_runtime::{Executor, ProcessRuntime, Runtime, RuntimeSpec};
use rc_types::{CaseDescriptor, Outcome, Output, TranscriptMarkers, WhitespacePolicy};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod classify;
pub mod report;
pub mod runner;

pub use classify::{classify, classify_run};
pub use report::{
    DiagnosticEntry, ResultRecord, RunHistoryEntry, RunReport, append_run_history, exit_code,
    render_summary, write_jsonl,
};
pub use runner::{CancelToken, ConformanceRunner, ReferenceCache};

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Cases(#[from] IoError),
    #[error(transparent)]
    Filter(#[from] regex::Error),
    #[error("invalid harness configuration: {0}")]
    Config(String),
}

/// Where reference outputs come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleMode {
    /// The expected-output file, with the live reference for programs it lacks.
    #[default]
    Stored,
    /// Always run the reference runtime.
    Live,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub case_root: PathBuf,
    pub expected_file: PathBuf,
    pub candidate: RuntimeSpec,
    pub reference: RuntimeSpec,
    pub oracle_mode: OracleMode,
    pub timeout_ms: u64,
    /// Worker threads; 0 means one per available core.
    pub workers: usize,
    pub markers: TranscriptMarkers,
    pub fail_on_unexpected_pass: bool,
    pub summary_limit: usize,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        let crate_root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        Self {
            case_root: crate_root.join("fixtures/cases"),
            expected_file: crate_root.join("fixtures/expected_output.txt"),
            candidate: RuntimeSpec::new("candidate", "Rscript").with_args(["-"]),
            reference: RuntimeSpec::new("gnur", "R").with_args(["--vanilla", "--no-echo"]),
            oracle_mode: OracleMode::Stored,
            timeout_ms: 30_000,
            workers: 0,
            markers: TranscriptMarkers::default(),
            fail_on_unexpected_pass: false,
            summary_limit: 20,
        }
    }

    /// Loads a YAML config. Relative paths resolve against the file's directory.
    pub fn from_yaml_file(path: &Path) -> Result<Self, HarnessError> {
        let body = fs::read_to_string(path)?;
        let mut config: Self = serde_yaml::from_str(&body)?;
        if let Some(base) = path.parent() {
            config.case_root = resolve(base, &config.case_root);
            config.expected_file = resolve(base, &config.expected_file);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.timeout_ms == 0 {
            return Err(HarnessError::Config("timeout_ms must be positive".to_owned()));
        }
        if self.candidate.command.trim().is_empty() {
            return Err(HarnessError::Config(
                "candidate runtime needs a command".to_owned(),
            ));
        }
        if self.markers.error.is_empty() || self.markers.warning.is_empty() {
            return Err(HarnessError::Config(
                "transcript markers must not be empty".to_owned(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    }

    #[must_use]
    pub fn candidate_runtime(&self) -> Arc<dyn Runtime> {
        Arc::new(ProcessRuntime::new(
            self.candidate.clone(),
            self.markers.clone(),
            self.timeout(),
        ))
    }

    #[must_use]
    pub fn reference_runtime(&self) -> Arc<dyn Runtime> {
        Arc::new(ProcessRuntime::new(
            self.reference.clone(),
            self.markers.clone(),
            self.timeout(),
        ))
    }

    /// Runner over the configured subprocess runtimes. Stored mode loads the
    /// expected-output file up front.
    pub fn build_runner(&self) -> Result<ConformanceRunner, HarnessError> {
        let runner = ConformanceRunner::new(self.candidate_runtime(), Executor::new(self.timeout()))
            .with_reference(self.reference_runtime())
            .with_markers(self.markers.clone())
            .with_workers(self.effective_workers());
        Ok(match self.oracle_mode {
            OracleMode::Stored => {
                runner.with_stored_expectations(ExpectedOutputFile::load(&self.expected_file)?)
            }
            OracleMode::Live => runner,
        })
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SuiteOptions {
    /// Regex over case ids.
    pub filter: Option<String>,
}

/// Loads the case tables under `config.case_root`, keeping ids that match
/// the filter.
pub fn load_cases(
    config: &HarnessConfig,
    options: &SuiteOptions,
) -> Result<Vec<CaseDescriptor>, HarnessError> {
    let cases = rc_io::load_case_tables(&config.case_root)?;
    filter_cases(cases, options.filter.as_deref())
}

pub fn filter_cases(
    cases: Vec<CaseDescriptor>,
    filter: Option<&str>,
) -> Result<Vec<CaseDescriptor>, HarnessError> {
    let Some(pattern) = filter else {
        return Ok(cases);
    };
    let pattern = Regex::new(pattern)?;
    Ok(cases
        .into_iter()
        .filter(|case| pattern.is_match(&case.id))
        .collect())
}

pub fn run_suite(
    config: &HarnessConfig,
    options: &SuiteOptions,
    cancel: &CancelToken,
) -> Result<RunReport, HarnessError> {
    let cases = load_cases(config, options)?;
    let runner = config.build_runner()?;
    Ok(run_cases(&runner, &cases, cancel))
}

#[must_use]
pub fn run_cases(
    runner: &ConformanceRunner,
    cases: &[CaseDescriptor],
    cancel: &CancelToken,
) -> RunReport {
    tracing::info!(
        cases = cases.len(),
        workers = runner.workers(),
        candidate = runner.candidate().name(),
        "conformance run started"
    );
    let report = RunReport::from_results(runner.run(cases, cancel));
    tracing::info!(
        total = report.total,
        pass = report.count(Outcome::Pass),
        unexpected_fail = report.count(Outcome::UnexpectedFail),
        unexpected_pass = report.count(Outcome::UnexpectedPass),
        cancelled = cancel.is_cancelled(),
        "conformance run finished"
    );
    report
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExpectedUpdate {
    pub changed: bool,
    pub entries: usize,
    /// Programs evaluated by the reference runtime for this update.
    pub evaluated: usize,
    /// Programs with no stored output that were not evaluated (check mode or
    /// a faulted reference run).
    pub missing: usize,
}

/// Rebuilds the expected-output file from the reference-compared cases.
/// Stored outputs are reused; new programs go to the live reference unless
/// `check_only` is set, in which case the file is never written.
pub fn generate_expected(
    runner: &ConformanceRunner,
    cases: &[CaseDescriptor],
    path: &Path,
    check_only: bool,
) -> Result<ExpectedUpdate, HarnessError> {
    let previous = ExpectedOutputFile::load(path)?;
    let wanted: Vec<&CaseDescriptor> = cases
        .iter()
        .filter(|case| case.expectation.uses_reference())
        .collect();

    let fresh = runner::parallel_map(runner.workers(), &wanted, |case| {
        let input = case.program_text();
        if previous.lookup(&case.group, &input).is_some() || check_only {
            return None;
        }
        match runner.live_reference(case) {
            Ok(output) => Some((case.id.clone(), output)),
            Err(fault) => {
                tracing::warn!(
                    case_id = %case.id,
                    %fault,
                    "reference run faulted, no expected output recorded"
                );
                None
            }
        }
    });
    let fresh: HashMap<String, Output> = fresh.into_iter().collect();

    let mut update = ExpectedUpdate {
        evaluated: fresh.len(),
        ..ExpectedUpdate::default()
    };
    let mut next = ExpectedOutputFile::new();
    for case in wanted {
        let input = case.program_text();
        let output = if let Some(entry) = previous.lookup(&case.group, &input) {
            entry.output.clone()
        } else if let Some(output) = fresh.get(&case.id) {
            let transcript = output.render_transcript(runner.matcher().markers());
            match case.policy.whitespace {
                WhitespacePolicy::Strict => transcript,
                WhitespacePolicy::TrimTrailing | WhitespacePolicy::IgnoreWhitespace => {
                    trim_trailing_spaces(&transcript)
                }
            }
        } else {
            update.missing += 1;
            continue;
        };
        next.insert(ExpectedEntry {
            group: case.group.clone(),
            traits: case_traits(case),
            input,
            output,
        });
    }

    update.entries = next.len();
    update.changed = write_if_changed(path, &next.render(), check_only)? || update.missing > 0;
    tracing::info!(
        path = %path.display(),
        entries = update.entries,
        evaluated = update.evaluated,
        missing = update.missing,
        changed = update.changed,
        check_only,
        "expected output file processed"
    );
    Ok(update)
}

/// Runs the candidate over every stored program that a case still uses and
/// writes a diff of the entries whose output differs. Returns `true` when
/// the candidate agrees with every stored entry.
pub fn generate_diff(
    runner: &ConformanceRunner,
    cases: &[CaseDescriptor],
    expected_path: &Path,
    diff_path: &Path,
) -> Result<bool, HarnessError> {
    let stored = ExpectedOutputFile::load(expected_path)?;
    let observed = runner::parallel_map(runner.workers(), cases, |case| {
        let input = case.program_text();
        stored.lookup(&case.group, &input)?;
        let execution = runner.execute_candidate(case);
        Some(ExpectedEntry {
            group: case.group.clone(),
            traits: case_traits(case),
            input,
            output: execution
                .output
                .render_transcript(runner.matcher().markers()),
        })
    });

    let mut candidate = ExpectedOutputFile::new();
    for entry in observed {
        candidate.insert(entry);
    }
    let reference_name = runner
        .reference()
        .map_or("reference", |runtime| runtime.name());
    let matches = write_diff(
        diff_path,
        &stored,
        &candidate,
        reference_name,
        runner.candidate().name(),
    )?;
    tracing::info!(path = %diff_path.display(), matches, "candidate diff processed");
    Ok(matches)
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{HarnessConfig, HarnessError, OracleMode, filter_cases};
    use rc_types::CaseDescriptor;

    #[test]
    fn default_paths_point_at_fixtures() {
        let config = HarnessConfig::default_paths();
        assert!(config.case_root.ends_with("fixtures/cases"));
        assert_eq!(config.timeout_ms, 30_000);
        assert_eq!(config.oracle_mode, OracleMode::Stored);
        assert!(config.effective_workers() >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn yaml_config_overrides_and_resolves_relative_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rconform.yaml");
        fs::write(
            &path,
            "case_root: cases\n\
             expected_file: /tmp/expected.txt\n\
             oracle_mode: live\n\
             timeout_ms: 500\n\
             workers: 3\n\
             candidate:\n  name: fastr\n  command: bin/fastr\n  args: [\"--silent\"]\n\
             markers:\n  error: Fehler\n  warning: Warnmeldung\n",
        )
        .expect("write config");
        let config = HarnessConfig::from_yaml_file(&path).expect("config");
        assert_eq!(config.case_root, dir.path().join("cases"));
        assert_eq!(config.expected_file, std::path::PathBuf::from("/tmp/expected.txt"));
        assert_eq!(config.oracle_mode, OracleMode::Live);
        assert_eq!(config.timeout_ms, 500);
        assert_eq!(config.effective_workers(), 3);
        assert_eq!(config.candidate.name, "fastr");
        assert_eq!(config.candidate.args, vec!["--silent".to_owned()]);
        assert_eq!(config.reference.name, "gnur");
        assert_eq!(config.markers.error, "Fehler");
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "timeout_ms: 0\n").expect("write");
        assert!(matches!(
            HarnessConfig::from_yaml_file(&path),
            Err(HarnessError::Config(_))
        ));
    }

    #[test]
    fn filter_is_a_regex_over_ids() {
        let cases = vec![
            CaseDescriptor::reference("builtins.c/1", "c(1)"),
            CaseDescriptor::reference("builtins.paste/1", "paste(1)"),
        ];
        let kept = filter_cases(cases.clone(), Some(r"^builtins\.c/")).expect("filter");
        assert_eq!(kept.len(), 1);
        assert_eq!(filter_cases(cases.clone(), None).expect("all").len(), 2);
        assert!(matches!(
            filter_cases(cases, Some("(")),
            Err(HarnessError::Filter(_))
        ));
    }
}
